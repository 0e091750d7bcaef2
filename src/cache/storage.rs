//! Cache storage trait and SQLite implementation.

use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::manifest::{Manifest, ManifestEntry};
use crate::error::{StorageError, StorageResult};
use crate::lookup::CacheIdentity;
use crate::range::{TimeRange, TimeUnit};

/// Where one page lives: identity, covered range and page index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageAddress {
  pub identity: CacheIdentity,
  pub range: TimeRange,
  pub index: usize,
}

impl fmt::Display for PageAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}#{}", self.identity, self.range, self.index)
  }
}

/// Trait for cache storage backends.
///
/// Writes at an address must be visible to the next read at that address.
/// Backends must accept concurrent writes to different identities.
pub trait CacheStorage: Send + Sync {
  /// Store serialized page bytes, replacing any page at the same address.
  fn put_page(&self, address: &PageAddress, bytes: &[u8]) -> StorageResult<()>;

  /// Read page bytes, `None` if nothing was stored at the address.
  fn get_page(&self, address: &PageAddress) -> StorageResult<Option<Vec<u8>>>;

  /// Read the manifest for an identity, `None` if it was never cached.
  fn load_manifest(&self, identity: &CacheIdentity) -> StorageResult<Option<Manifest>>;

  /// Replace the manifest for `manifest.identity`.
  fn store_manifest(&self, manifest: &Manifest) -> StorageResult<()>;

  /// All identities with a stored manifest.
  fn identities(&self) -> StorageResult<Vec<CacheIdentity>>;
}

impl<S: CacheStorage + ?Sized> CacheStorage for Box<S> {
  fn put_page(&self, address: &PageAddress, bytes: &[u8]) -> StorageResult<()> {
    (**self).put_page(address, bytes)
  }

  fn get_page(&self, address: &PageAddress) -> StorageResult<Option<Vec<u8>>> {
    (**self).get_page(address)
  }

  fn load_manifest(&self, identity: &CacheIdentity) -> StorageResult<Option<Manifest>> {
    (**self).load_manifest(identity)
  }

  fn store_manifest(&self, manifest: &Manifest) -> StorageResult<()> {
    (**self).store_manifest(manifest)
  }

  fn identities(&self) -> StorageResult<Vec<CacheIdentity>> {
    (**self).identities()
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - every lookup is a full miss.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put_page(&self, _address: &PageAddress, _bytes: &[u8]) -> StorageResult<()> {
    Ok(()) // Discard
  }

  fn get_page(&self, _address: &PageAddress) -> StorageResult<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn load_manifest(&self, _identity: &CacheIdentity) -> StorageResult<Option<Manifest>> {
    Ok(None) // Always miss
  }

  fn store_manifest(&self, _manifest: &Manifest) -> StorageResult<()> {
    Ok(()) // Discard
  }

  fn identities(&self) -> StorageResult<Vec<CacheIdentity>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Open the cache database at the default location.
  pub fn open_default() -> StorageResult<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Private database that vanishes with the value.
  pub fn open_in_memory() -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        StorageError::Io(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "Could not determine data directory",
        ))
      })?;

    Ok(data_dir.join("tscache").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> StorageResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> StorageResult<()> {
    self.conn()?.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Serialized pages, one row per (identity, range, index)
CREATE TABLE IF NOT EXISTS cache_pages (
    identity_hash TEXT NOT NULL,
    cache_range TEXT NOT NULL,
    page_index INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (identity_hash, cache_range, page_index)
);

-- Known identities
CREATE TABLE IF NOT EXISTS cache_identities (
    identity_hash TEXT PRIMARY KEY,
    bucket TEXT NOT NULL,
    keys TEXT NOT NULL,
    unit TEXT NOT NULL
);

-- Manifest entries per identity
CREATE TABLE IF NOT EXISTS manifest_entries (
    identity_hash TEXT NOT NULL,
    cache_range TEXT NOT NULL,
    complete INTEGER NOT NULL,
    page_count INTEGER NOT NULL,
    PRIMARY KEY (identity_hash, cache_range)
);

CREATE INDEX IF NOT EXISTS idx_manifest_entries_identity ON manifest_entries(identity_hash);
"#;

impl CacheStorage for SqliteStorage {
  fn put_page(&self, address: &PageAddress, bytes: &[u8]) -> StorageResult<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_pages (identity_hash, cache_range, page_index, data)
       VALUES (?, ?, ?, ?)",
      params![
        address.identity.digest(),
        address.range.to_string(),
        address.index as i64,
        bytes
      ],
    )?;
    Ok(())
  }

  fn get_page(&self, address: &PageAddress) -> StorageResult<Option<Vec<u8>>> {
    let conn = self.conn()?;
    let data = conn
      .query_row(
        "SELECT data FROM cache_pages
         WHERE identity_hash = ? AND cache_range = ? AND page_index = ?",
        params![
          address.identity.digest(),
          address.range.to_string(),
          address.index as i64
        ],
        |row| row.get::<_, Vec<u8>>(0),
      )
      .optional()?;
    Ok(data)
  }

  fn load_manifest(&self, identity: &CacheIdentity) -> StorageResult<Option<Manifest>> {
    let conn = self.conn()?;
    let hash = identity.digest();

    let unit: Option<String> = conn
      .query_row(
        "SELECT unit FROM cache_identities WHERE identity_hash = ?",
        params![hash],
        |row| row.get(0),
      )
      .optional()?;

    let unit: TimeUnit = match unit {
      Some(unit) => unit.parse().map_err(|e| corrupt(identity, e))?,
      None => return Ok(None),
    };

    let mut stmt = conn.prepare(
      "SELECT cache_range, complete, page_count FROM manifest_entries
       WHERE identity_hash = ?",
    )?;

    let rows: Vec<(String, bool, i64)> = stmt
      .query_map(params![hash], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
      .collect::<Result<_, _>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    for (range, complete, page_count) in rows {
      let range: TimeRange = range.parse().map_err(|e| corrupt(identity, e))?;
      let page_count = usize::try_from(page_count)
        .map_err(|_| corrupt(identity, format!("negative page count {}", page_count)))?;
      entries.push(ManifestEntry {
        range,
        complete,
        page_count,
      });
    }

    Ok(Some(Manifest::from_entries(identity.clone(), unit, entries)))
  }

  fn store_manifest(&self, manifest: &Manifest) -> StorageResult<()> {
    let mut conn = self.conn()?;
    let hash = manifest.identity.digest();
    let keys = serde_json::to_string(&manifest.identity.keys)?;

    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_identities (identity_hash, bucket, keys, unit)
       VALUES (?, ?, ?, ?)",
      params![hash, manifest.identity.bucket, keys, manifest.unit.to_string()],
    )?;
    tx.execute(
      "DELETE FROM manifest_entries WHERE identity_hash = ?",
      params![hash],
    )?;
    for entry in manifest.entries() {
      tx.execute(
        "INSERT INTO manifest_entries (identity_hash, cache_range, complete, page_count)
         VALUES (?, ?, ?, ?)",
        params![
          hash,
          entry.range.to_string(),
          entry.complete,
          entry.page_count as i64
        ],
      )?;
    }
    tx.commit()?;

    Ok(())
  }

  fn identities(&self) -> StorageResult<Vec<CacheIdentity>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT bucket, keys FROM cache_identities ORDER BY bucket, keys")?;
    let rows: Vec<(String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<_, _>>()?;

    rows
      .into_iter()
      .map(|(bucket, keys)| -> StorageResult<CacheIdentity> {
        let keys: Vec<String> = serde_json::from_str(&keys)?;
        Ok(CacheIdentity { bucket, keys })
      })
      .collect()
  }
}

pub(crate) fn corrupt(identity: &CacheIdentity, reason: impl ToString) -> StorageError {
  StorageError::CorruptManifest {
    identity: identity.to_string(),
    reason: reason.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheManager, Cacheable};
  use crate::lookup::Lookup;

  fn identity(key: &str) -> CacheIdentity {
    CacheIdentity {
      bucket: "npm-downloads".to_string(),
      keys: vec![key.to_string()],
    }
  }

  fn range() -> TimeRange {
    TimeRange::from_iso("2022-01-01", "2022-01-02").unwrap()
  }

  #[test]
  fn test_sqlite_page_roundtrip_and_replace() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let address = PageAddress {
      identity: identity("left-pad"),
      range: range(),
      index: 0,
    };

    assert_eq!(storage.get_page(&address).unwrap(), None);
    storage.put_page(&address, b"first").unwrap();
    storage.put_page(&address, b"second").unwrap();
    assert_eq!(storage.get_page(&address).unwrap(), Some(b"second".to_vec()));

    let other = PageAddress {
      index: 1,
      ..address.clone()
    };
    assert_eq!(storage.get_page(&other).unwrap(), None);
  }

  #[test]
  fn test_sqlite_manifest_roundtrip() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.load_manifest(&identity("a")).unwrap().is_none());

    let mut manifest = Manifest::new(identity("a"), TimeUnit::Week);
    manifest.record_page(range(), 0, true);
    manifest.record_page(TimeRange::from_iso("2021-12-01", "2021-12-02").unwrap(), 0, false);
    storage.store_manifest(&manifest).unwrap();

    let loaded = storage.load_manifest(&identity("a")).unwrap().unwrap();
    assert_eq!(loaded, manifest);

    manifest.record_page(range(), 1, false);
    storage.store_manifest(&manifest).unwrap();
    assert_eq!(storage.load_manifest(&identity("a")).unwrap().unwrap(), manifest);
    assert_eq!(storage.identities().unwrap(), vec![identity("a")]);
  }

  #[test]
  fn test_sqlite_open_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let storage = SqliteStorage::open(&path).unwrap();
    storage
      .store_manifest(&Manifest::new(identity("x"), TimeUnit::Day))
      .unwrap();
    drop(storage);

    let reopened = SqliteStorage::open(&path).unwrap();
    assert!(reopened.load_manifest(&identity("x")).unwrap().is_some());
  }

  #[test]
  fn test_sqlite_concurrent_writes_to_distinct_identities() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CacheManager::new(SqliteStorage::open(&dir.path().join("cache.db")).unwrap());

    let handles: Vec<_> = (0..8)
      .map(|t| {
        let manager = manager.clone();
        std::thread::spawn(move || {
          let lookup = Lookup::new("npm-downloads", format!("pkg-{}", t), range(), None).unwrap();
          for n in 0..20 {
            manager.write(&lookup, &Cacheable::new(n, n < 19, range()), n).unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(manager.identities().unwrap().len(), 8);
    for t in 0..8 {
      let manifest = manager.manifest(&identity(&format!("pkg-{}", t))).unwrap().unwrap();
      let entry = manifest.entry(&range()).unwrap();
      assert!(entry.complete);
      assert_eq!(entry.page_count, 20);
    }
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    let mut manifest = Manifest::new(identity("a"), TimeUnit::Day);
    manifest.record_page(range(), 0, false);
    storage.store_manifest(&manifest).unwrap();
    assert!(storage.load_manifest(&identity("a")).unwrap().is_none());
    assert!(storage.identities().unwrap().is_empty());
  }
}
