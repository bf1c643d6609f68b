//! Typed ID definitions for the engine's entities.

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for users (owned by the external account system).
pub struct User;

/// Marker type for discovered job postings.
pub struct Job;

/// Marker type for applications.
pub struct Application;

/// Marker type for crawl requests.
pub struct CrawlRequest;

/// Marker type for usage records.
pub struct UsageRecord;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

pub type UserId = Id<User>;
pub type JobId = Id<Job>;
pub type ApplicationId = Id<Application>;
pub type CrawlRequestId = Id<CrawlRequest>;
pub type UsageRecordId = Id<UsageRecord>;
