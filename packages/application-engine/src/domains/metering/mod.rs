pub mod meter;
pub mod models;

pub use meter::UsageMeter;
pub use models::*;
