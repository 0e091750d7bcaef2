//! Incremental cache for paginated time-series sources.
//!
//! This module provides the caching mechanism that:
//! - Tracks which sub-ranges of a series are durably cached (the manifest)
//! - Streams cached pages straight from storage
//! - Calls a retriever only for the gaps, persisting every page it returns
//! - Resumes interrupted page sequences after a failure or restart

mod fs;
mod layer;
mod manager;
mod manifest;
mod storage;
mod traits;

pub use fs::FsStorage;
pub use layer::CacheLayer;
pub use manager::{CacheManager, CacheReadHandle, PageIter, RangeGroup};
pub use manifest::{Manifest, ManifestEntry};
pub use storage::{CacheStorage, NoopStorage, PageAddress, SqliteStorage};
pub use traits::{CachePayload, Cacheable};
