//! Per-identity index of cached sub-ranges.

use serde::{Deserialize, Serialize};

use crate::lookup::CacheIdentity;
use crate::range::{TimeRange, TimeUnit};

/// One cached sub-range and how many pages it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub range: TimeRange,
  /// A page with `has_next_page == false` has been written for this range
  pub complete: bool,
  pub page_count: usize,
}

/// Durable record of what is cached for one identity.
///
/// Entries are kept ordered by range start, then end. Ranges are not merged:
/// each entry addresses its own page sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub identity: CacheIdentity,
  pub unit: TimeUnit,
  entries: Vec<ManifestEntry>,
}

impl Manifest {
  pub fn new(identity: CacheIdentity, unit: TimeUnit) -> Self {
    Self {
      identity,
      unit,
      entries: Vec::new(),
    }
  }

  /// Build from stored entries in any order.
  pub fn from_entries(identity: CacheIdentity, unit: TimeUnit, mut entries: Vec<ManifestEntry>) -> Self {
    entries.sort_by_key(|e| e.range);
    Self {
      identity,
      unit,
      entries,
    }
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }

  pub fn entry(&self, range: &TimeRange) -> Option<&ManifestEntry> {
    self
      .entries
      .binary_search_by_key(range, |e| e.range)
      .ok()
      .map(|i| &self.entries[i])
  }

  pub fn complete_ranges(&self) -> Vec<TimeRange> {
    self
      .entries
      .iter()
      .filter(|e| e.complete)
      .map(|e| e.range)
      .collect()
  }

  /// Forget the pages of `range` so it gets fetched again from scratch.
  pub(crate) fn demote(&mut self, range: &TimeRange) {
    if let Ok(idx) = self.entries.binary_search_by_key(range, |e| e.range) {
      self.entries[idx].complete = false;
      self.entries[idx].page_count = 0;
    }
  }

  /// Record that page `page_index` of `range` has been written.
  ///
  /// The page written last is the tail of the range's sequence: its count
  /// becomes `page_index + 1` and any later stored pages are stale. A final
  /// page (`has_next_page == false`) completes the range, a continuation page
  /// leaves it incomplete until its successors are written.
  pub fn record_page(&mut self, range: TimeRange, page_index: usize, has_next_page: bool) {
    let idx = match self.entries.binary_search_by_key(&range, |e| e.range) {
      Ok(idx) => idx,
      Err(idx) => {
        self.entries.insert(
          idx,
          ManifestEntry {
            range,
            complete: false,
            page_count: 0,
          },
        );
        idx
      }
    };

    let entry = &mut self.entries[idx];
    entry.complete = !has_next_page;
    entry.page_count = page_index + 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity() -> CacheIdentity {
    CacheIdentity {
      bucket: "bucket".to_string(),
      keys: vec!["key".to_string()],
    }
  }

  fn r(start: &str, end: &str) -> TimeRange {
    TimeRange::from_iso(start, end).unwrap()
  }

  #[test]
  fn test_pages_accumulate_until_final() {
    let mut manifest = Manifest::new(identity(), TimeUnit::Day);
    let range = r("2022-01-10", "2022-01-12");

    manifest.record_page(range, 0, true);
    manifest.record_page(range, 1, true);
    let entry = manifest.entry(&range).unwrap();
    assert!(!entry.complete);
    assert_eq!(entry.page_count, 2);

    manifest.record_page(range, 2, false);
    let entry = manifest.entry(&range).unwrap();
    assert!(entry.complete);
    assert_eq!(entry.page_count, 3);
    assert_eq!(manifest.complete_ranges(), vec![range]);
  }

  #[test]
  fn test_rewrite_is_idempotent() {
    let mut manifest = Manifest::new(identity(), TimeUnit::Day);
    let range = r("2022-01-01", "2022-01-02");
    manifest.record_page(range, 0, true);
    manifest.record_page(range, 1, false);
    let before = manifest.clone();

    manifest.record_page(range, 0, true);
    manifest.record_page(range, 1, false);
    assert_eq!(manifest, before);
  }

  #[test]
  fn test_continuation_on_tail_reopens() {
    let mut manifest = Manifest::new(identity(), TimeUnit::Day);
    let range = r("2022-01-01", "2022-01-02");
    manifest.record_page(range, 0, false);
    manifest.record_page(range, 0, true);
    assert!(!manifest.entry(&range).unwrap().complete);
  }

  #[test]
  fn test_refetch_from_start_drops_old_tail() {
    let mut manifest = Manifest::new(identity(), TimeUnit::Day);
    let range = r("2022-01-01", "2022-01-02");
    manifest.record_page(range, 0, true);
    manifest.record_page(range, 1, false);

    manifest.record_page(range, 0, true);
    let entry = manifest.entry(&range).unwrap();
    assert!(!entry.complete);
    assert_eq!(entry.page_count, 1);
    assert!(manifest.complete_ranges().is_empty());
  }

  #[test]
  fn test_entries_stay_ordered() {
    let mut manifest = Manifest::new(identity(), TimeUnit::Day);
    manifest.record_page(r("2022-01-04", "2022-01-05"), 0, false);
    manifest.record_page(r("2022-01-01", "2022-01-02"), 0, false);
    manifest.record_page(r("2022-01-01", "2022-01-01T12:00:00Z"), 0, true);

    let starts: Vec<_> = manifest.entries().iter().map(|e| e.range).collect();
    assert_eq!(
      starts,
      vec![
        r("2022-01-01", "2022-01-01T12:00:00Z"),
        r("2022-01-01", "2022-01-02"),
        r("2022-01-04", "2022-01-05"),
      ]
    );
    assert_eq!(manifest.complete_ranges().len(), 2);
  }
}
