//! Kernel module - storage and external collaborators.
//!
//! `store` defines the persistence traits, implemented by `PostgresStore` and
//! `MemoryStore`; `traits` defines the collaborators the engine consumes but
//! does not own.

pub mod artifacts;
pub mod memory_store;
pub mod postgres_store;
pub mod store;
pub mod test_dependencies;
pub mod traits;

pub use artifacts::FileArtifactStore;
pub use memory_store::MemoryStore;
pub use postgres_store::PostgresStore;
pub use store::{ApplicationStore, CrawlStore, JobStore, Store, UsageStore};
pub use traits::*;
