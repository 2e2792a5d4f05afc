//! Versioned resource cache for offline serving.
//!
//! This module provides:
//! - Named caches keyed by request URL, persisted in SQLite
//! - Install-time population from a fixed manifest (all-or-nothing)
//! - Activation that drops every cache but the current version
//! - Network-first request handling with cache and offline-page fallback

mod manager;
mod storage;
mod types;

pub use manager::CacheManager;
pub use storage::{CacheStorage, SqliteCacheStorage};
pub use types::{CachedResponse, FetchOutcome, ResponseSource};
