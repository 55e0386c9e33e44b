// src/models/mod.rs

//! Domain models for the aggregation pipeline.
//!
//! Raw events, the reference data aggregates are keyed by, and configuration.

mod config;
mod link_event;
mod organisation;
mod pattern;

// Re-export all public types
pub use config::{
    ArchiveConfig, Config, DatabaseConfig, LoggingConfig, StorageBackend, StorageConfig,
};
pub use link_event::{ChangeKind, LinkEvent, NewLinkEvent, hash_link_event_id};
pub use organisation::{Collection, Organisation, Program};
pub use pattern::{LIBRARY_PROXY_SUFFIX, UrlPattern};
