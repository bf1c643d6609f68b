pub mod adapter;
pub mod json_feed;
pub mod limiter;
pub mod models;
pub mod scheduler;

pub use adapter::{AdapterRegistry, SourceAdapter};
pub use json_feed::JsonFeedAdapter;
pub use models::*;
pub use scheduler::{CrawlScheduler, CrawlSettings};
