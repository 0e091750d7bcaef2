//! Half-open time ranges and gap arithmetic.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, SecondsFormat, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, Result};

/// A half-open time range `[start, end)` in UTC.
///
/// The canonical string form is ISO-8601 interval notation
/// (`2022-01-01T00:00:00Z/2022-01-02T00:00:00Z`). It is used as a storage key
/// component and round-trips through `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeRange {
  start: DateTime<Utc>,
  end: DateTime<Utc>,
}

impl TimeRange {
  /// Create a range, failing when `start > end`.
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
    if start > end {
      return Err(CacheError::InvalidRange(format!(
        "start {} is after end {}",
        format_instant(&start),
        format_instant(&end)
      )));
    }
    Ok(Self { start, end })
  }

  /// Parse both bounds from ISO strings.
  ///
  /// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates, which are taken
  /// as midnight UTC.
  pub fn from_iso(start: &str, end: &str) -> Result<Self> {
    Self::new(parse_instant(start)?, parse_instant(end)?)
  }

  pub fn start(&self) -> DateTime<Utc> {
    self.start
  }

  pub fn end(&self) -> DateTime<Utc> {
    self.end
  }

  pub fn is_empty(&self) -> bool {
    self.start == self.end
  }

  pub fn duration(&self) -> TimeDelta {
    self.end - self.start
  }

  pub fn contains(&self, instant: DateTime<Utc>) -> bool {
    self.start <= instant && instant < self.end
  }

  /// True when `other` lies entirely inside this range.
  pub fn covers(&self, other: &TimeRange) -> bool {
    self.start <= other.start && other.end <= self.end
  }

  /// True when the two ranges share a non-empty span.
  pub fn intersects(&self, other: &TimeRange) -> bool {
    self.start < other.end && other.start < self.end
  }

  pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
    if !self.intersects(other) {
      return None;
    }
    Some(TimeRange {
      start: self.start.max(other.start),
      end: self.end.min(other.end),
    })
  }

  /// Compare by canonical string form.
  pub fn same_as(&self, other: &TimeRange) -> bool {
    self.to_string() == other.to_string()
  }

  /// Gaps of this range not covered by any of `covered`.
  pub fn missing(&self, covered: &[TimeRange]) -> Vec<TimeRange> {
    find_missing_ranges(self.start, self.end, covered)
  }

  /// UTC dates overlapping this range, in order.
  pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
    let first = if self.is_empty() {
      None
    } else {
      Some(self.start.date_naive())
    };
    std::iter::successors(first, |day| day.succ_opt())
      .take_while(move |day| midnight(*day) < self.end)
  }

  /// Path-safe variant of the canonical form (no `:` or `/`).
  pub fn file_stem(&self) -> String {
    format!(
      "{}_{}",
      self.start.format("%Y%m%dT%H%M%S%.fZ"),
      self.end.format("%Y%m%dT%H%M%S%.fZ")
    )
  }
}

impl fmt::Display for TimeRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}",
      format_instant(&self.start),
      format_instant(&self.end)
    )
  }
}

impl FromStr for TimeRange {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self> {
    let (start, end) = s
      .split_once('/')
      .ok_or_else(|| CacheError::InvalidRange(format!("'{}' is not a start/end interval", s)))?;
    Self::from_iso(start, end)
  }
}

impl TryFrom<String> for TimeRange {
  type Error = CacheError;

  fn try_from(value: String) -> Result<Self> {
    value.parse()
  }
}

impl From<TimeRange> for String {
  fn from(range: TimeRange) -> Self {
    range.to_string()
  }
}

fn format_instant(instant: &DateTime<Utc>) -> String {
  instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Ok(dt.with_timezone(&Utc));
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map(midnight)
    .map_err(|e| CacheError::InvalidRange(format!("Failed to parse timestamp '{}': {}", s, e)))
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
  day.and_time(NaiveTime::MIN).and_utc()
}

/// Granularity used to bucket a lookup's range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
  Hour,
  #[default]
  Day,
  /// ISO weeks, starting on Monday
  Week,
  Month,
  Year,
}

impl TimeUnit {
  /// Round down to the start of the enclosing unit.
  pub fn floor(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
    let day = instant.date_naive();
    match self {
      Self::Hour => instant
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(instant),
      Self::Day => midnight(day),
      Self::Week => midnight(day - TimeDelta::days(day.weekday().num_days_from_monday() as i64)),
      Self::Month => midnight(NaiveDate::from_ymd_opt(day.year(), day.month(), 1).unwrap_or(day)),
      Self::Year => midnight(NaiveDate::from_ymd_opt(day.year(), 1, 1).unwrap_or(day)),
    }
  }

  /// Round up to the next unit boundary; boundaries map to themselves.
  pub fn ceil(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
    let floor = self.floor(instant);
    if floor == instant {
      return instant;
    }
    match self {
      Self::Hour => floor + TimeDelta::hours(1),
      Self::Day => floor + TimeDelta::days(1),
      Self::Week => floor + TimeDelta::weeks(1),
      Self::Month => floor.checked_add_months(Months::new(1)).unwrap_or(instant),
      Self::Year => floor.checked_add_months(Months::new(12)).unwrap_or(instant),
    }
  }
}

impl fmt::Display for TimeUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Hour => "hour",
      Self::Day => "day",
      Self::Week => "week",
      Self::Month => "month",
      Self::Year => "year",
    };
    f.write_str(name)
  }
}

impl FromStr for TimeUnit {
  type Err = CacheError;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_lowercase().as_str() {
      "hour" => Ok(Self::Hour),
      "day" => Ok(Self::Day),
      "week" => Ok(Self::Week),
      "month" => Ok(Self::Month),
      "year" => Ok(Self::Year),
      other => Err(CacheError::InvalidInput(format!("Unknown time unit '{}'", other))),
    }
  }
}

/// Sort and merge ranges into disjoint maximal intervals.
///
/// Overlapping and touching ranges (`[a,b)` followed by `[b,c)`) collapse into
/// one interval. Empty ranges are dropped.
pub fn merge_ranges(ranges: &[TimeRange]) -> Vec<TimeRange> {
  let mut sorted: Vec<TimeRange> = ranges.iter().filter(|r| !r.is_empty()).copied().collect();
  sorted.sort_by_key(|r| (r.start, r.end));

  let mut merged: Vec<TimeRange> = Vec::with_capacity(sorted.len());
  for range in sorted {
    match merged.last_mut() {
      Some(last) if range.start <= last.end => {
        if range.end > last.end {
          last.end = range.end;
        }
      }
      _ => merged.push(range),
    }
  }
  merged
}

/// Gaps within `[start, end)` not covered by any range in `covered`.
///
/// Runs in `O(n log n)` over the covered ranges, independent of how long the
/// requested span is. Returns gaps in chronological order; an empty or
/// inverted request yields no gaps.
pub fn find_missing_ranges(
  start: DateTime<Utc>,
  end: DateTime<Utc>,
  covered: &[TimeRange],
) -> Vec<TimeRange> {
  let mut gaps = Vec::new();
  if start >= end {
    return gaps;
  }

  let mut cursor = start;
  for range in merge_ranges(covered) {
    if range.end <= cursor {
      continue;
    }
    if range.start >= end {
      break;
    }
    if range.start > cursor {
      gaps.push(TimeRange {
        start: cursor,
        end: range.start,
      });
    }
    cursor = range.end;
    if cursor >= end {
      break;
    }
  }

  if cursor < end {
    gaps.push(TimeRange { start: cursor, end });
  }
  gaps
}

/// Set of fully covered UTC days with O(1) membership tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaySet {
  days: HashSet<NaiveDate>,
}

impl DaySet {
  /// Collect every day whose whole 24 hours is covered by `ranges`.
  pub fn from_ranges(ranges: &[TimeRange]) -> Self {
    let mut days = HashSet::new();
    for range in merge_ranges(ranges) {
      for day in range.days() {
        let day_start = midnight(day);
        if day_start >= range.start && day_start + TimeDelta::days(1) <= range.end {
          days.insert(day);
        }
      }
    }
    Self { days }
  }

  pub fn contains(&self, day: NaiveDate) -> bool {
    self.days.contains(&day)
  }

  pub fn len(&self) -> usize {
    self.days.len()
  }

  pub fn is_empty(&self) -> bool {
    self.days.is_empty()
  }

  /// Days overlapping `range` that are not in the set, in order.
  pub fn missing_days(&self, range: &TimeRange) -> Vec<NaiveDate> {
    range.days().filter(|day| !self.contains(*day)).collect()
  }
}
