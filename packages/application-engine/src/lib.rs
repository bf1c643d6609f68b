// Application Engine - crawling and automated job applications
//
// This crate discovers postings from job boards, keeps them deduplicated in a
// job registry, and drives browser-automation attempts to apply on a user's
// behalf. Every attempt runs through the application state machine; every
// crawl, scoring call and form fill is metered.
//
// Domains are organized under domains/*; storage and external collaborators
// live in kernel/.

pub mod common;
pub mod config;
pub mod domains;
pub mod engine;
pub mod error;
pub mod kernel;

pub use config::*;
pub use engine::{Engine, EngineDeps, StartupReport};
pub use error::{EngineError, Result};
