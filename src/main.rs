mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use tscache::cache::CacheManager;
use tscache::{CacheIdentity, Lookup, TimeRange, TimeUnit};

#[derive(Parser, Debug)]
#[command(name = "tscache")]
#[command(about = "Inspect an incremental time-series cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tscache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List every cached series
  Identities,
  /// Show the manifest of one series
  Manifest {
    bucket: String,
    #[arg(required = true)]
    keys: Vec<String>,
  },
  /// Show which parts of a range are not cached yet
  Missing {
    #[command(flatten)]
    target: Target,
  },
  /// Print cached pages of a range as JSON lines
  Dump {
    #[command(flatten)]
    target: Target,
  },
}

#[derive(clap::Args, Debug)]
struct Target {
  /// Series kind, e.g. npm-downloads
  bucket: String,
  /// Entity keys, e.g. a package name
  #[arg(required = true)]
  keys: Vec<String>,
  /// Range start (RFC 3339 or YYYY-MM-DD)
  #[arg(long)]
  start: String,
  /// Range end, exclusive
  #[arg(long)]
  end: String,
  /// Granularity the range is widened to
  #[arg(long, default_value = "day")]
  unit: TimeUnit,
}

impl Target {
  fn lookup(&self) -> Result<Lookup> {
    let range = TimeRange::from_iso(&self.start, &self.end)?;
    let lookup = Lookup::new(self.bucket.clone(), self.keys.clone(), range, Some(self.unit))?;
    Ok(lookup.aligned())
  }
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.log)?;

  let manager = CacheManager::new(config.open_storage()?);

  match args.command {
    Command::Identities => {
      for identity in manager.identities()? {
        println!("{}", identity);
      }
    }
    Command::Manifest { bucket, keys } => {
      let identity = CacheIdentity { bucket, keys };
      let manifest = manager
        .manifest(&identity)?
        .ok_or_else(|| eyre!("Nothing cached for {}", identity))?;

      println!("{} ({})", manifest.identity, manifest.unit);
      for entry in manifest.entries() {
        let state = if entry.complete { "complete" } else { "partial" };
        println!("{}\t{}\t{} pages", entry.range, state, entry.page_count);
      }
    }
    Command::Missing { target } => {
      let lookup = target.lookup()?;
      let handle = manager.load::<serde_json::Value>(&lookup)?;

      let gaps = handle.missing();
      for gap in &gaps {
        println!("{}", gap);
      }
      let missing_days = handle.cached_days().missing_days(&lookup.range());
      eprintln!(
        "{}: {} gaps, {} of {} days not cached",
        lookup,
        gaps.len(),
        missing_days.len(),
        lookup.range().days().count()
      );
    }
    Command::Dump { target } => {
      let lookup = target.lookup()?;
      let handle = manager.load::<serde_json::Value>(&lookup)?;

      for group in handle.groups() {
        for page in group.load() {
          println!("{}", serde_json::to_string(&page?)?);
        }
      }
      for gap in handle.missing() {
        eprintln!("not cached: {}", gap);
      }
    }
  }

  Ok(())
}
