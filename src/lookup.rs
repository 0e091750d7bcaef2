//! Cache addressing: which series, and which slice of time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CacheError, Result};
use crate::range::{TimeRange, TimeUnit};

/// Identity of a cached series: the bucket plus its ordered discriminator keys.
///
/// The manifest is keyed by identity; ranges are tracked as entries under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheIdentity {
  pub bucket: String,
  pub keys: Vec<String>,
}

impl CacheIdentity {
  /// SHA256 hash for stable, fixed-length, path-safe names
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    // length-prefixed so ["ab"] and ["a", "b"] never collide
    for part in std::iter::once(&self.bucket).chain(&self.keys) {
      hasher.update((part.len() as u64).to_be_bytes());
      hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.bucket, self.keys.join(","))
  }
}

/// One key or a list of keys.
#[derive(Debug, Clone)]
pub struct Keys(Vec<String>);

impl From<&str> for Keys {
  fn from(key: &str) -> Self {
    Keys(vec![key.to_string()])
  }
}

impl From<String> for Keys {
  fn from(key: String) -> Self {
    Keys(vec![key])
  }
}

impl From<Vec<String>> for Keys {
  fn from(keys: Vec<String>) -> Self {
    Keys(keys)
  }
}

impl From<Vec<&str>> for Keys {
  fn from(keys: Vec<&str>) -> Self {
    Keys(keys.into_iter().map(String::from).collect())
  }
}

impl From<&[&str]> for Keys {
  fn from(keys: &[&str]) -> Self {
    Keys(keys.iter().map(|k| k.to_string()).collect())
  }
}

impl<const N: usize> From<[&str; N]> for Keys {
  fn from(keys: [&str; N]) -> Self {
    Keys(keys.iter().map(|k| k.to_string()).collect())
  }
}

/// Literal lookup fields, e.g. as read from a job definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawLookup {
  pub bucket: String,
  pub keys: Vec<String>,
  pub start: String,
  pub end: String,
  #[serde(default)]
  pub unit: TimeUnit,
}

/// A cache key: series identity plus the requested range and granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
  identity: CacheIdentity,
  range: TimeRange,
  unit: TimeUnit,
}

impl Lookup {
  /// Build a lookup from a single key or a list of keys.
  ///
  /// `unit` defaults to [`TimeUnit::Day`].
  pub fn new(
    bucket: impl Into<String>,
    keys: impl Into<Keys>,
    range: TimeRange,
    unit: Option<TimeUnit>,
  ) -> Result<Self> {
    let bucket = bucket.into();
    let Keys(keys) = keys.into();

    if bucket.trim().is_empty() {
      return Err(CacheError::InvalidInput("bucket must not be empty".to_string()));
    }
    if keys.is_empty() {
      return Err(CacheError::InvalidInput(format!(
        "lookup in bucket '{}' needs at least one key",
        bucket
      )));
    }
    if let Some(pos) = keys.iter().position(|k| k.trim().is_empty()) {
      return Err(CacheError::InvalidInput(format!(
        "key {} in bucket '{}' is empty",
        pos, bucket
      )));
    }

    Ok(Self {
      identity: CacheIdentity { bucket, keys },
      range,
      unit: unit.unwrap_or_default(),
    })
  }

  pub fn from_raw(raw: RawLookup) -> Result<Self> {
    let range = TimeRange::from_iso(&raw.start, &raw.end)?;
    Self::new(raw.bucket, raw.keys, range, Some(raw.unit))
  }

  pub fn identity(&self) -> &CacheIdentity {
    &self.identity
  }

  pub fn bucket(&self) -> &str {
    &self.identity.bucket
  }

  pub fn keys(&self) -> &[String] {
    &self.identity.keys
  }

  pub fn range(&self) -> TimeRange {
    self.range
  }

  pub fn unit(&self) -> TimeUnit {
    self.unit
  }

  /// Same identity and unit, different range.
  pub fn with_range(&self, range: TimeRange) -> Self {
    Self {
      identity: self.identity.clone(),
      range,
      unit: self.unit,
    }
  }

  /// Copy whose range is widened outward to the unit's boundaries.
  pub fn aligned(&self) -> Self {
    let start = self.unit.floor(self.range.start());
    let end = self.unit.ceil(self.range.end());
    // floor/ceil never invert an ordered pair
    let range = TimeRange::new(start, end).unwrap_or(self.range);
    self.with_range(range)
  }
}

impl fmt::Display for Lookup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{} ({})", self.identity, self.range, self.unit)
  }
}
