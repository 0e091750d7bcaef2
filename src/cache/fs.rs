//! Filesystem tree storage.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<bucket>/<identity digest>/manifest.json
//! <root>/<bucket>/<identity digest>/pages/<range stem>/<index>.json
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::manifest::Manifest;
use super::storage::{corrupt, CacheStorage, PageAddress};
use crate::error::StorageResult;
use crate::lookup::CacheIdentity;

const MANIFEST_FILE: &str = "manifest.json";
const PAGES_DIR: &str = "pages";

/// Cache storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
  root: PathBuf,
}

impl FsStorage {
  /// Use `root` as the cache root, creating it if needed.
  pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn identity_dir(&self, identity: &CacheIdentity) -> PathBuf {
    self
      .root
      .join(sanitize(&identity.bucket))
      .join(identity.digest())
  }

  fn page_path(&self, address: &PageAddress) -> PathBuf {
    self
      .identity_dir(&address.identity)
      .join(PAGES_DIR)
      .join(address.range.file_stem())
      .join(format!("{}.json", address.index))
  }
}

impl CacheStorage for FsStorage {
  fn put_page(&self, address: &PageAddress, bytes: &[u8]) -> StorageResult<()> {
    write_atomic(&self.page_path(address), bytes)
  }

  fn get_page(&self, address: &PageAddress) -> StorageResult<Option<Vec<u8>>> {
    read_optional(&self.page_path(address))
  }

  fn load_manifest(&self, identity: &CacheIdentity) -> StorageResult<Option<Manifest>> {
    let path = self.identity_dir(identity).join(MANIFEST_FILE);
    let Some(bytes) = read_optional(&path)? else {
      return Ok(None);
    };

    let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| corrupt(identity, e))?;
    if &manifest.identity != identity {
      return Err(corrupt(
        identity,
        format!("manifest at {} belongs to {}", path.display(), manifest.identity),
      ));
    }
    Ok(Some(manifest))
  }

  fn store_manifest(&self, manifest: &Manifest) -> StorageResult<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    write_atomic(
      &self.identity_dir(&manifest.identity).join(MANIFEST_FILE),
      &bytes,
    )
  }

  fn identities(&self) -> StorageResult<Vec<CacheIdentity>> {
    let mut identities = Vec::new();
    for bucket in fs::read_dir(&self.root)? {
      let bucket = bucket?;
      if !bucket.file_type()?.is_dir() {
        continue;
      }
      for entry in fs::read_dir(bucket.path())? {
        let path = entry?.path().join(MANIFEST_FILE);
        let Some(bytes) = read_optional(&path)? else {
          continue;
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
          Ok(manifest) => identities.push(manifest.identity),
          Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable manifest"),
        }
      }
    }
    identities.sort();
    Ok(identities)
  }
}

/// Write through a uniquely named temp file and rename, so readers never see
/// a torn file and concurrent writers never share a temp file.
fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
  let parent = path.parent().unwrap_or_else(|| Path::new("."));
  fs::create_dir_all(parent)?;

  let mut tmp = NamedTempFile::new_in(parent)?;
  tmp.write_all(bytes)?;
  tmp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
  match fs::read(path) {
    Ok(bytes) => Ok(Some(bytes)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}

/// Keep bucket names readable on disk without letting them escape the root.
fn sanitize(bucket: &str) -> String {
  bucket
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
        c
      } else {
        '_'
      }
    })
    .collect()
}
