//! Error types for the cache.

use thiserror::Error;

/// Boxed error produced by a caller-supplied retriever.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
  /// Start after end, or a timestamp that does not parse
  #[error("Invalid range: {0}")]
  InvalidRange(String),

  /// Malformed lookup fields
  #[error("Invalid input: {0}")]
  InvalidInput(String),

  /// Durable read/write failure
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),

  /// The retrieval function failed
  #[error("Retriever failed: {0}")]
  Retriever(#[source] BoxError),

  /// A stored page could not be decoded while streaming it
  #[error("Malformed cache entry at {address}: {reason}")]
  MalformedCacheEntry { address: String, reason: String },
}

/// Errors raised by storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Manifest exists but cannot be understood
  #[error("Corrupt manifest for {identity}: {reason}")]
  CorruptManifest { identity: String, reason: String },

  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Result type alias for storage backends
pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl CacheError {
  pub(crate) fn retriever(err: impl Into<BoxError>) -> Self {
    CacheError::Retriever(err.into())
  }
}
