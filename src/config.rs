use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use tscache::cache::{CacheStorage, FsStorage, NoopStorage, SqliteStorage};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  /// Single SQLite database at `<root>/cache.db`
  #[default]
  Sqlite,
  /// One directory per identity under `<root>`
  Fs,
  /// Caching disabled
  #[serde(rename = "none")]
  Disabled,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub backend: Backend,
  /// Cache root (defaults to $XDG_DATA_HOME/tscache)
  pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is not set
  #[serde(default = "default_level")]
  pub level: String,
  /// Write daily log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      directory: None,
    }
  }
}

fn default_level() -> String {
  "tscache=info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tscache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tscache/config.yaml
  /// 4. Built-in defaults
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tscache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tscache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Resolve the cache root.
  ///
  /// Checks TSCACHE_CACHE_DIR first, then the config file, then the data dir.
  pub fn cache_root(&self) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TSCACHE_CACHE_DIR") {
      return Ok(PathBuf::from(dir));
    }
    if let Some(root) = &self.cache.root {
      return Ok(root.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("tscache"))
  }

  /// Open the configured storage backend, creating its root if needed.
  pub fn open_storage(&self) -> Result<Box<dyn CacheStorage>> {
    let storage: Box<dyn CacheStorage> = match self.cache.backend {
      Backend::Sqlite => {
        let path = self.cache_root()?.join("cache.db");
        Box::new(
          SqliteStorage::open(&path)
            .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?,
        )
      }
      Backend::Fs => {
        let root = self.cache_root()?;
        Box::new(
          FsStorage::open(&root)
            .map_err(|e| eyre!("Failed to open cache directory {}: {}", root.display(), e))?,
        )
      }
      Backend::Disabled => Box::new(NoopStorage),
    };
    Ok(storage)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.backend, Backend::Sqlite);
    assert!(config.cache.root.is_none());
    assert_eq!(config.log.level, "tscache=info");
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
cache:
  backend: fs
  root: /var/cache/tscache
log:
  level: debug
  directory: /var/log/tscache
"#,
    )
    .unwrap();
    assert_eq!(config.cache.backend, Backend::Fs);
    assert_eq!(config.cache.root, Some(PathBuf::from("/var/cache/tscache")));
    assert_eq!(config.log.directory, Some(PathBuf::from("/var/log/tscache")));
  }

  #[test]
  fn test_unknown_backend_is_rejected() {
    assert!(Config::parse("cache:\n  backend: redis\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(dir.path().join("nope.yaml").as_path())).is_err());
  }

  #[test]
  fn test_open_fs_storage_under_configured_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("cache");
    let path = dir.path().join("tscache.yaml");
    std::fs::write(&path, format!("cache:\n  backend: fs\n  root: {}\n", root.display())).unwrap();

    let config = Config::load(Some(path.as_path())).unwrap();
    config.open_storage().unwrap();
    // TSCACHE_CACHE_DIR may point elsewhere on a developer machine
    if std::env::var("TSCACHE_CACHE_DIR").is_err() {
      assert!(root.is_dir());
    }
  }
}
