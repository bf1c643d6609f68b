// Common test utilities

pub mod fixtures;
pub mod harness;
pub mod postgres;

pub use fixtures::*;
pub use harness::*;
pub use postgres::*;
