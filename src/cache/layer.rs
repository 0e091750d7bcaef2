//! Cache layer that reconciles cached pages with freshly retrieved ones.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::future::Future;

use tracing::{debug, info, warn};

use super::manager::{CacheManager, CacheReadHandle, PageIter};
use super::manifest::ManifestEntry;
use super::traits::{CachePayload, Cacheable};
use crate::error::{BoxError, CacheError, Result};
use crate::lookup::Lookup;
use crate::range::{find_missing_ranges, TimeRange};

/// Cache layer that drives a retriever only for what is not cached yet.
///
/// This layer sits between the application and an external API client. It
/// streams cached pages straight from storage and persists every retrieved
/// page before handing it on.
#[derive(Clone)]
pub struct CacheLayer {
  manager: CacheManager,
}

impl CacheLayer {
  /// Create a new cache layer over the given manager.
  pub fn new(manager: CacheManager) -> Self {
    Self { manager }
  }

  pub fn manager(&self) -> &CacheManager {
    &self.manager
  }

  /// Stream every page for `lookup`, from cache where possible.
  ///
  /// 1. Load the cached state - nothing happens until the stream is polled
  /// 2. Cached groups are streamed from storage
  /// 3. Each gap is filled by calling `retriever(range, last_page)` until a
  ///    page reports no successor; every page is written, then yielded
  /// 4. Interrupted sub-ranges resume from their last persisted page
  ///
  /// Output is ordered by range start. The first error ends the stream; pages
  /// written before it stay cached. Only one retriever call is in flight at a
  /// time, and dropping the stream stops further calls.
  pub fn load_cached_or_retrieve<T, F, Fut, E>(
    &self,
    lookup: &Lookup,
    retriever: F,
  ) -> impl Stream<Item = Result<Cacheable<T>>>
  where
    T: CachePayload,
    F: FnMut(TimeRange, Option<Cacheable<T>>) -> Fut,
    Fut: Future<Output = std::result::Result<Cacheable<T>, E>>,
    E: Into<BoxError>,
  {
    let reconciler = Reconciler {
      manager: self.manager.clone(),
      lookup: lookup.clone(),
      plan: None,
      active: Active::Idle,
      retriever,
    };
    stream::try_unfold(reconciler, Reconciler::step)
  }
}

/// One stretch of the requested range, in output order.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
  /// Completely cached; stream from storage
  Cached(ManifestEntry),
  /// Not cached; ask the retriever, resuming an interrupted entry if given
  Fetch {
    range: TimeRange,
    resume: Option<ManifestEntry>,
  },
}

impl Segment {
  fn start(&self) -> DateTime<Utc> {
    match self {
      Segment::Cached(entry) => entry.range.start(),
      Segment::Fetch { range, .. } => range.start(),
    }
  }
}

/// Order cached groups and gap work chronologically.
///
/// Inside a gap, an incomplete entry starting at the cursor is resumed as its
/// own segment; the stretches around it are fetched fresh.
fn plan<T: CachePayload>(handle: &CacheReadHandle<T>) -> VecDeque<Segment> {
  let mut segments: Vec<Segment> = Vec::new();
  let mut groups: Vec<ManifestEntry> = handle
    .groups()
    .map(|g| ManifestEntry {
      range: g.range(),
      complete: true,
      page_count: g.page_count(),
    })
    .collect();
  groups.sort_by_key(|g| (g.range.start(), Reverse(g.range.end())));

  // a group covered by the kept groups plus the ones still ahead would only
  // repeat their data; skipping it never loses coverage
  let mut kept: Vec<TimeRange> = Vec::new();
  for (i, group) in groups.iter().enumerate() {
    let others: Vec<TimeRange> = kept
      .iter()
      .copied()
      .chain(groups[i + 1..].iter().map(|g| g.range))
      .collect();
    if find_missing_ranges(group.range.start(), group.range.end(), &others).is_empty() {
      debug!(lookup = %handle.lookup(), range = %group.range, "skipping redundant cached group");
      continue;
    }
    kept.push(group.range);
    segments.push(Segment::Cached(group.clone()));
  }

  let incomplete = handle.incomplete();
  for gap in handle.missing() {
    let mut cursor = gap.start();
    for entry in incomplete.iter().filter(|e| gap.covers(&e.range)) {
      if entry.range.start() < cursor {
        continue;
      }
      if entry.range.start() > cursor {
        if let Ok(range) = TimeRange::new(cursor, entry.range.start()) {
          segments.push(Segment::Fetch { range, resume: None });
        }
      }
      segments.push(Segment::Fetch {
        range: entry.range,
        resume: (entry.page_count > 0).then(|| entry.clone()),
      });
      cursor = entry.range.end();
    }
    if cursor < gap.end() {
      if let Ok(range) = TimeRange::new(cursor, gap.end()) {
        segments.push(Segment::Fetch { range, resume: None });
      }
    }
  }

  segments.sort_by_key(|s| s.start());
  segments.into()
}

/// Retriever progress on one segment.
struct FetchState<T> {
  requested: TimeRange,
  last_page: Option<Cacheable<T>>,
  /// Next page index per returned `cache_range`
  next_index: HashMap<TimeRange, usize>,
}

impl<T> FetchState<T> {
  fn fresh(requested: TimeRange) -> Self {
    Self {
      requested,
      last_page: None,
      next_index: HashMap::new(),
    }
  }
}

enum Active<T> {
  Idle,
  Cached(PageIter<T>),
  /// Pages persisted by an interrupted run, replayed before fetching on
  Replay {
    pages: VecDeque<Cacheable<T>>,
    fetch: FetchState<T>,
  },
  Fetch(FetchState<T>),
}

struct Reconciler<T, F> {
  manager: CacheManager,
  lookup: Lookup,
  plan: Option<(CacheReadHandle<T>, VecDeque<Segment>)>,
  active: Active<T>,
  retriever: F,
}

impl<T, F, Fut, E> Reconciler<T, F>
where
  T: CachePayload,
  F: FnMut(TimeRange, Option<Cacheable<T>>) -> Fut,
  Fut: Future<Output = std::result::Result<Cacheable<T>, E>>,
  E: Into<BoxError>,
{
  async fn step(mut self) -> Result<Option<(Cacheable<T>, Self)>> {
    loop {
      match std::mem::replace(&mut self.active, Active::Idle) {
        Active::Idle => {
          if self.plan.is_none() {
            let handle = self.manager.load::<T>(&self.lookup)?;
            let segments = plan(&handle);
            if handle.missing().is_empty() {
              info!(lookup = %self.lookup, groups = segments.len(), "full cache hit");
            } else {
              debug!(lookup = %self.lookup, segments = ?segments, "planned retrieval");
            }
            self.plan = Some((handle, segments));
          }

          let Some((handle, segments)) = self.plan.as_mut() else {
            return Ok(None);
          };
          self.active = match segments.pop_front() {
            None => return Ok(None),
            Some(Segment::Cached(entry)) => Active::Cached(handle.pages(&entry)),
            Some(Segment::Fetch { range, resume: None }) => Active::Fetch(FetchState::fresh(range)),
            Some(Segment::Fetch {
              range,
              resume: Some(entry),
            }) => resume(handle, range, &entry),
          };
        }
        Active::Cached(mut pages) => {
          if let Some(page) = pages.next() {
            let page = page?;
            self.active = Active::Cached(pages);
            return Ok(Some((page, self)));
          }
        }
        Active::Replay { mut pages, fetch } => {
          if let Some(page) = pages.pop_front() {
            self.active = Active::Replay { pages, fetch };
            return Ok(Some((page, self)));
          }
          self.active = Active::Fetch(fetch);
        }
        Active::Fetch(mut fetch) => {
          let page = (self.retriever)(fetch.requested, fetch.last_page.clone())
            .await
            .map_err(CacheError::retriever)?;

          let slot = fetch.next_index.entry(page.cache_range).or_insert(0);
          let index = *slot;
          *slot += 1;

          // no await between here and the yield: a started write always completes
          self.manager.write(&self.lookup, &page, index)?;
          info!(
            lookup = %self.lookup,
            requested = %fetch.requested,
            range = %page.cache_range,
            index,
            has_next = page.has_next_page,
            "retrieved page"
          );

          if page.has_next_page {
            fetch.last_page = Some(page.clone());
            self.active = Active::Fetch(fetch);
          }
          return Ok(Some((page, self)));
        }
      }
    }
  }
}

/// Set up replay of an interrupted entry followed by fetching its remainder.
///
/// Stored pages are read up front; if any of them is unusable the entry is
/// fetched again from its first page instead.
fn resume<T: CachePayload>(handle: &CacheReadHandle<T>, range: TimeRange, entry: &ManifestEntry) -> Active<T> {
  match handle.pages(entry).collect::<Result<VecDeque<_>>>() {
    Ok(pages) => {
      let mut fetch = FetchState::fresh(range);
      fetch.last_page = pages.back().cloned();
      fetch.next_index.insert(entry.range, pages.len());
      info!(lookup = %handle.lookup(), range = %range, pages = pages.len(), "resuming interrupted range");
      Active::Replay { pages, fetch }
    }
    Err(e) => {
      warn!(lookup = %handle.lookup(), range = %range, error = %e, "cannot resume, refetching range");
      Active::Fetch(FetchState::fresh(range))
    }
  }
}
