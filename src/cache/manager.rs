//! Durable page storage and manifest bookkeeping, addressed by lookup identity.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use super::manifest::{Manifest, ManifestEntry};
use super::storage::{CacheStorage, PageAddress};
use super::traits::{CachePayload, Cacheable};
use crate::error::{CacheError, Result, StorageError};
use crate::lookup::{CacheIdentity, Lookup};
use crate::range::{find_missing_ranges, DaySet, TimeRange};

/// Reads and writes cached pages through a storage backend.
///
/// Cheap to clone; all clones share the backend.
#[derive(Clone)]
pub struct CacheManager {
  storage: Arc<dyn CacheStorage>,
}

impl CacheManager {
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Persist `page` as page `page_index` of its `cache_range`.
  ///
  /// Rewriting the same address replaces the page. The manifest entry for the
  /// range becomes complete once a page without a successor is written.
  pub fn write<T: CachePayload>(&self, lookup: &Lookup, page: &Cacheable<T>, page_index: usize) -> Result<()> {
    let address = PageAddress {
      identity: lookup.identity().clone(),
      range: page.cache_range,
      index: page_index,
    };
    let bytes = serde_json::to_vec(page).map_err(StorageError::from)?;
    self.storage.put_page(&address, &bytes)?;

    let mut manifest = self
      .storage
      .load_manifest(lookup.identity())?
      .unwrap_or_else(|| Manifest::new(lookup.identity().clone(), lookup.unit()));
    manifest.record_page(page.cache_range, page_index, page.has_next_page);
    self.storage.store_manifest(&manifest)?;

    debug!(address = %address, has_next = page.has_next_page, "stored page");
    Ok(())
  }

  /// Snapshot the cached state for `lookup`. Never touches the network.
  ///
  /// Complete entries whose pages are missing or fail to decode are logged and
  /// treated as not cached, so the gap-filling path fetches them again.
  /// Backend failures while reading those pages are returned as errors.
  pub fn load<T: CachePayload>(&self, lookup: &Lookup) -> Result<CacheReadHandle<T>> {
    let mut manifest = self.storage.load_manifest(lookup.identity())?;

    if let Some(manifest) = manifest.as_mut() {
      let suspect: Vec<ManifestEntry> = manifest
        .entries()
        .iter()
        .filter(|e| e.complete && e.range.intersects(&lookup.range()))
        .cloned()
        .collect();

      for entry in suspect {
        let pages = PageIter::<T>::new(self.storage.clone(), lookup.identity().clone(), &entry);
        match pages.into_iter().find(|p| p.is_err()) {
          Some(Err(e @ CacheError::MalformedCacheEntry { .. })) => {
            warn!(lookup = %lookup, range = %entry.range, error = %e, "discarding malformed cache entry");
            manifest.demote(&entry.range);
          }
          Some(Err(e)) => return Err(e),
          _ => {}
        }
      }
    }

    Ok(CacheReadHandle {
      storage: self.storage.clone(),
      lookup: lookup.clone(),
      manifest,
      _payload: PhantomData,
    })
  }

  pub fn manifest(&self, identity: &CacheIdentity) -> Result<Option<Manifest>> {
    Ok(self.storage.load_manifest(identity)?)
  }

  pub fn identities(&self) -> Result<Vec<CacheIdentity>> {
    Ok(self.storage.identities()?)
  }
}

/// Cached state of one lookup, as read by [`CacheManager::load`].
pub struct CacheReadHandle<T> {
  storage: Arc<dyn CacheStorage>,
  lookup: Lookup,
  manifest: Option<Manifest>,
  _payload: PhantomData<fn() -> T>,
}

impl<T: CachePayload> CacheReadHandle<T> {
  pub fn lookup(&self) -> &Lookup {
    &self.lookup
  }

  /// The manifest as seen by this handle, with malformed entries demoted.
  pub fn manifest(&self) -> Option<&Manifest> {
    self.manifest.as_ref()
  }

  /// Sub-ranges of the lookup range that are not completely cached.
  pub fn missing(&self) -> Vec<TimeRange> {
    let range = self.lookup.range();
    match &self.manifest {
      None => vec![range],
      Some(manifest) => find_missing_ranges(range.start(), range.end(), &manifest.complete_ranges()),
    }
  }

  /// One group per complete entry intersecting the lookup range, by start.
  pub fn groups(&self) -> impl Iterator<Item = RangeGroup<T>> + '_ {
    let range = self.lookup.range();
    self
      .entries()
      .filter(move |e| e.complete && e.range.intersects(&range))
      .map(|e| RangeGroup {
        storage: self.storage.clone(),
        identity: self.lookup.identity().clone(),
        entry: e.clone(),
        _payload: PhantomData,
      })
  }

  /// Incomplete entries lying inside the lookup range, by start.
  ///
  /// Entries with pages are left over from an interrupted run and can be
  /// resumed.
  pub fn incomplete(&self) -> Vec<ManifestEntry> {
    let range = self.lookup.range();
    self
      .entries()
      .filter(|e| !e.complete && !e.range.is_empty() && range.covers(&e.range))
      .cloned()
      .collect()
  }

  /// Lazily read the stored pages of `entry`, in index order.
  pub fn pages(&self, entry: &ManifestEntry) -> PageIter<T> {
    PageIter::new(self.storage.clone(), self.lookup.identity().clone(), entry)
  }

  /// Last persisted page of `entry`, if it has any.
  pub fn last_page(&self, entry: &ManifestEntry) -> Result<Option<Cacheable<T>>> {
    if entry.page_count == 0 {
      return Ok(None);
    }
    let address = PageAddress {
      identity: self.lookup.identity().clone(),
      range: entry.range,
      index: entry.page_count - 1,
    };
    read_page(self.storage.as_ref(), &address).map(Some)
  }

  /// Days of the lookup range that are completely cached.
  pub fn cached_days(&self) -> DaySet {
    let ranges: Vec<TimeRange> = self
      .groups()
      .filter_map(|g| g.range().intersection(&self.lookup.range()))
      .collect();
    DaySet::from_ranges(&ranges)
  }

  fn entries(&self) -> impl Iterator<Item = &ManifestEntry> + '_ {
    self.manifest.iter().flat_map(|m| m.entries())
  }
}

/// A completely cached sub-range and its pages.
pub struct RangeGroup<T> {
  storage: Arc<dyn CacheStorage>,
  identity: CacheIdentity,
  entry: ManifestEntry,
  _payload: PhantomData<fn() -> T>,
}

impl<T: CachePayload> RangeGroup<T> {
  pub fn range(&self) -> TimeRange {
    self.entry.range
  }

  pub fn page_count(&self) -> usize {
    self.entry.page_count
  }

  /// Lazily read this group's pages in stored index order.
  pub fn load(&self) -> PageIter<T> {
    PageIter::new(self.storage.clone(), self.identity.clone(), &self.entry)
  }
}

/// Lazy iterator over the stored pages of one range.
pub struct PageIter<T> {
  storage: Arc<dyn CacheStorage>,
  identity: CacheIdentity,
  range: TimeRange,
  next: usize,
  count: usize,
  _payload: PhantomData<fn() -> T>,
}

impl<T> PageIter<T> {
  fn new(storage: Arc<dyn CacheStorage>, identity: CacheIdentity, entry: &ManifestEntry) -> Self {
    Self {
      storage,
      identity,
      range: entry.range,
      next: 0,
      count: entry.page_count,
      _payload: PhantomData,
    }
  }
}

impl<T: CachePayload> Iterator for PageIter<T> {
  type Item = Result<Cacheable<T>>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.count {
      return None;
    }
    let address = PageAddress {
      identity: self.identity.clone(),
      range: self.range,
      index: self.next,
    };
    self.next += 1;
    Some(read_page(self.storage.as_ref(), &address))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let left = self.count.saturating_sub(self.next);
    (left, Some(left))
  }
}

fn read_page<T: CachePayload>(storage: &dyn CacheStorage, address: &PageAddress) -> Result<Cacheable<T>> {
  let bytes = storage
    .get_page(address)?
    .ok_or_else(|| malformed(address, "page is listed in the manifest but not stored"))?;
  let page: Cacheable<T> = serde_json::from_slice(&bytes).map_err(|e| malformed(address, e))?;
  if page.cache_range != address.range {
    return Err(malformed(
      address,
      format!("page covers {} instead", page.cache_range),
    ));
  }
  Ok(page)
}

fn malformed(address: &PageAddress, reason: impl ToString) -> CacheError {
  CacheError::MalformedCacheEntry {
    address: address.to_string(),
    reason: reason.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::fs::FsStorage;
  use crate::cache::storage::SqliteStorage;

  fn r(start: &str, end: &str) -> TimeRange {
    TimeRange::from_iso(start, end).unwrap()
  }

  fn lookup(start: &str, end: &str) -> Lookup {
    Lookup::new("bucket", "key", r(start, end), None).unwrap()
  }

  fn manager() -> CacheManager {
    CacheManager::new(SqliteStorage::open_in_memory().unwrap())
  }

  #[test]
  fn test_no_manifest_means_everything_missing() {
    let manager = manager();
    let handle = manager.load::<Vec<u32>>(&lookup("2022-01-01", "2022-01-05")).unwrap();
    assert_eq!(handle.missing(), vec![r("2022-01-01", "2022-01-05")]);
    assert_eq!(handle.groups().count(), 0);
    assert!(handle.manifest().is_none());
  }

  #[test]
  fn test_write_then_load_groups() {
    let manager = manager();
    let lookup = lookup("2022-01-01", "2022-01-05");
    manager
      .write(&lookup, &Cacheable::more(vec![1u32], r("2022-01-04", "2022-01-05")), 0)
      .unwrap();
    manager
      .write(&lookup, &Cacheable::last(vec![2u32], r("2022-01-04", "2022-01-05")), 1)
      .unwrap();
    manager
      .write(&lookup, &Cacheable::last(vec![0u32], r("2022-01-01", "2022-01-02")), 0)
      .unwrap();

    let handle = manager.load::<Vec<u32>>(&lookup).unwrap();
    assert_eq!(handle.missing(), vec![r("2022-01-02", "2022-01-04")]);

    let groups: Vec<_> = handle.groups().collect();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].range(), r("2022-01-01", "2022-01-02"));
    let raws: Vec<Vec<u32>> = groups[1].load().map(|p| p.unwrap().raw).collect();
    assert_eq!(raws, vec![vec![1], vec![2]]);
  }

  #[test]
  fn test_incomplete_entry_is_missing_but_resumable() {
    let manager = manager();
    let lookup = lookup("2022-01-10", "2022-01-12");
    let range = lookup.range();
    manager.write(&lookup, &Cacheable::more("a".to_string(), range), 0).unwrap();
    manager.write(&lookup, &Cacheable::more("b".to_string(), range), 1).unwrap();

    let handle = manager.load::<String>(&lookup).unwrap();
    assert_eq!(handle.missing(), vec![range]);
    let incomplete = handle.incomplete();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].page_count, 2);
    assert_eq!(handle.last_page(&incomplete[0]).unwrap().unwrap().raw, "b");
  }

  #[test]
  fn test_malformed_page_demotes_entry() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::open(dir.path()).unwrap();
    let manager = CacheManager::new(storage.clone());
    let lookup = lookup("2022-01-01", "2022-01-03");
    let day = r("2022-01-01", "2022-01-02");
    manager.write(&lookup, &Cacheable::last(7u64, day), 0).unwrap();
    manager
      .write(&lookup, &Cacheable::last(8u64, r("2022-01-02", "2022-01-03")), 0)
      .unwrap();

    let address = PageAddress {
      identity: lookup.identity().clone(),
      range: day,
      index: 0,
    };
    storage.put_page(&address, b"\x00garbage").unwrap();

    let handle = manager.load::<u64>(&lookup).unwrap();
    assert_eq!(handle.missing(), vec![day]);
    assert_eq!(handle.groups().count(), 1);
    // the durable manifest is untouched until the range is refetched
    assert!(manager.manifest(lookup.identity()).unwrap().unwrap().entry(&day).unwrap().complete);
  }

  /// Backend whose page reads fail, as with an unreadable disk.
  struct UnreadablePages(SqliteStorage);

  impl CacheStorage for UnreadablePages {
    fn put_page(&self, address: &PageAddress, bytes: &[u8]) -> crate::error::StorageResult<()> {
      self.0.put_page(address, bytes)
    }

    fn get_page(&self, _address: &PageAddress) -> crate::error::StorageResult<Option<Vec<u8>>> {
      Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied").into())
    }

    fn load_manifest(&self, identity: &CacheIdentity) -> crate::error::StorageResult<Option<Manifest>> {
      self.0.load_manifest(identity)
    }

    fn store_manifest(&self, manifest: &Manifest) -> crate::error::StorageResult<()> {
      self.0.store_manifest(manifest)
    }

    fn identities(&self) -> crate::error::StorageResult<Vec<CacheIdentity>> {
      self.0.identities()
    }
  }

  #[test]
  fn test_storage_failure_during_load_is_returned() {
    let manager = CacheManager::new(UnreadablePages(SqliteStorage::open_in_memory().unwrap()));
    let lookup = lookup("2022-01-01", "2022-01-02");
    manager.write(&lookup, &Cacheable::last(1u8, lookup.range()), 0).unwrap();

    let err = manager.load::<u8>(&lookup).err().unwrap();
    assert!(matches!(err, CacheError::Storage(StorageError::Io(_))));
  }

  #[test]
  fn test_refetch_of_healed_range_is_incomplete_until_final_page() {
    let manager = manager();
    let lookup = lookup("2022-01-01", "2022-01-02");
    let range = lookup.range();
    manager.write(&lookup, &Cacheable::more("old0".to_string(), range), 0).unwrap();
    manager.write(&lookup, &Cacheable::last("old1".to_string(), range), 1).unwrap();

    manager.write(&lookup, &Cacheable::more("new0".to_string(), range), 0).unwrap();

    let handle = manager.load::<String>(&lookup).unwrap();
    assert_eq!(handle.missing(), vec![range]);
    let incomplete = handle.incomplete();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].page_count, 1);
    assert_eq!(handle.last_page(&incomplete[0]).unwrap().unwrap().raw, "new0");
  }

  #[test]
  fn test_empty_range_without_manifest_is_missing_as_is() {
    let manager = manager();
    let lookup = lookup("2022-01-01", "2022-01-01");
    let handle = manager.load::<u8>(&lookup).unwrap();
    assert_eq!(handle.missing(), vec![lookup.range()]);
  }

  #[test]
  fn test_wrong_payload_type_is_malformed() {
    let manager = manager();
    let lookup = lookup("2022-01-01", "2022-01-02");
    manager
      .write(&lookup, &Cacheable::last("text".to_string(), lookup.range()), 0)
      .unwrap();

    let handle = manager.load::<u64>(&lookup).unwrap();
    assert_eq!(handle.missing(), vec![lookup.range()]);
  }

  #[test]
  fn test_groups_include_entries_crossing_lookup_edges() {
    let manager = manager();
    let wide = lookup("2022-01-01", "2022-01-10");
    manager
      .write(&wide, &Cacheable::last(1u8, r("2022-01-01", "2022-01-04")), 0)
      .unwrap();

    let narrow = wide.with_range(r("2022-01-03", "2022-01-05"));
    let handle = manager.load::<u8>(&narrow).unwrap();
    assert_eq!(handle.missing(), vec![r("2022-01-04", "2022-01-05")]);
    assert_eq!(handle.groups().map(|g| g.range()).collect::<Vec<_>>(), vec![r("2022-01-01", "2022-01-04")]);

    let days = handle.cached_days();
    assert_eq!(days.len(), 1);
    assert!(days.contains(chrono::NaiveDate::from_ymd_opt(2022, 1, 3).unwrap()));
  }

  #[test]
  fn test_rewrite_same_address_replaces() {
    let manager = manager();
    let lookup = lookup("2022-01-01", "2022-01-02");
    manager.write(&lookup, &Cacheable::last(1u8, lookup.range()), 0).unwrap();
    manager.write(&lookup, &Cacheable::last(2u8, lookup.range()), 0).unwrap();

    let handle = manager.load::<u8>(&lookup).unwrap();
    let pages: Vec<_> = handle.groups().flat_map(|g| g.load().collect::<Vec<_>>()).collect();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].as_ref().unwrap().raw, 2);
  }
}
