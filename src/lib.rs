//! Incremental cache for time-series data pulled from paginated,
//! rate-limited APIs.
//!
//! A [`Lookup`] names a series and the time range of interest. The
//! [`cache::CacheLayer`] works out which sub-ranges are already durably
//! cached, streams those from storage, and calls a caller-supplied retriever
//! only for the gaps. Every retrieved page is persisted before it is yielded,
//! so an interrupted run resumes where it stopped.
//!
//! ```no_run
//! use futures::TryStreamExt;
//! use tscache::cache::{CacheLayer, CacheManager, Cacheable, SqliteStorage};
//! use tscache::{Lookup, TimeRange};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let layer = CacheLayer::new(CacheManager::new(SqliteStorage::open_default()?));
//! let range = TimeRange::from_iso("2022-01-01", "2022-02-01")?;
//! let lookup = Lookup::new("npm-downloads", "left-pad", range, None)?;
//!
//! let pages: Vec<Cacheable<u64>> = layer
//!   .load_cached_or_retrieve(&lookup, |range, _last| async move {
//!     // call the real API here
//!     Ok::<_, std::io::Error>(Cacheable::last(0, range))
//!   })
//!   .try_collect()
//!   .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod lookup;
pub mod range;

pub use error::{CacheError, Result};
pub use lookup::{CacheIdentity, Keys, Lookup, RawLookup};
pub use range::{find_missing_ranges, merge_ranges, DaySet, TimeRange, TimeUnit};
