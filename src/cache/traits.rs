//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::range::TimeRange;

/// Trait for payloads that can be cached.
///
/// Blanket-implemented; the bound keeps a retriever's result type and the
/// stored type identical for a given series.
pub trait CachePayload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CachePayload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// One retrieved or stored page of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cacheable<T> {
  /// The payload as delivered by the source
  pub raw: T,
  /// The source has more data for the same `cache_range`
  pub has_next_page: bool,
  /// Range actually covered by `raw`
  pub cache_range: TimeRange,
}

impl<T> Cacheable<T> {
  pub fn new(raw: T, has_next_page: bool, cache_range: TimeRange) -> Self {
    Self {
      raw,
      has_next_page,
      cache_range,
    }
  }

  /// Final page for `cache_range`.
  pub fn last(raw: T, cache_range: TimeRange) -> Self {
    Self::new(raw, false, cache_range)
  }

  /// A page with more to come for `cache_range`.
  pub fn more(raw: T, cache_range: TimeRange) -> Self {
    Self::new(raw, true, cache_range)
  }
}
