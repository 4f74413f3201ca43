//! Periodic recurrence bookkeeping.
//!
//! One [`SchedulerEntry`] per periodic job. Entries never submit anything on
//! their own; the backend's `tick` asks which entries are due, fires them, and
//! submits a task for each.

use crate::job::{JobKind, Recurrence};
use crate::registry::JobRegistry;

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

/// Result of [`SchedulerEntry::is_due`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueStatus {
  pub due: bool,
  /// Time until the entry is next due. When `due` is set this is the full
  /// interval to the following occurrence.
  pub next_in: StdDuration,
}

impl DueStatus {
  pub fn seconds_until_next(&self) -> f64 {
    self.next_in.as_secs_f64()
  }
}

/// Recurrence state of one periodic job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerEntry {
  pub name: String,
  pub run_every: StdDuration,
  pub anchor: Option<DateTime<Utc>>,
  /// Time of the last fire. Only moves forward.
  pub last_run_at: Option<DateTime<Utc>>,
  pub total_run_count: u64,
}

fn millis(d: StdDuration) -> i64 {
  i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `anchor + k * every_ms`, or `None` if it leaves the representable range.
fn boundary(anchor: DateTime<Utc>, k: i64, every_ms: i64) -> Option<DateTime<Utc>> {
  k.checked_mul(every_ms)
    .and_then(Duration::try_milliseconds)
    .and_then(|offset| anchor.checked_add_signed(offset))
}

impl SchedulerEntry {
  pub fn new(name: &str, recurrence: &Recurrence) -> Self {
    Self {
      name: name.to_string(),
      run_every: recurrence.run_every,
      anchor: recurrence.anchor,
      last_run_at: None,
      total_run_count: 0,
    }
  }

  /// The last run time the recurrence arithmetic works from.
  ///
  /// Without an anchor this is `last_run_at`. With one, `last_run_at` is floored
  /// to the closest earlier boundary `anchor + k * run_every`; an entry that
  /// never fired is placed one interval before the first boundary at or after
  /// `now`. `None` means "never fired, due immediately". Boundaries outside the
  /// representable date range fall back to the unanchored behavior.
  pub fn scheduled_last_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let every = millis(self.run_every).max(1);
    let Some(anchor) = self.anchor else {
      return self.last_run_at;
    };
    match self.last_run_at {
      Some(last) => {
        let k = (last - anchor).num_milliseconds().div_euclid(every);
        Some(boundary(anchor, k, every).unwrap_or(last))
      }
      None => {
        let since = (now - anchor).num_milliseconds();
        // Ceiling division: first boundary at or after `now`.
        let k = since.div_euclid(every) + i64::from(since.rem_euclid(every) != 0);
        k.checked_sub(1).and_then(|k| boundary(anchor, k, every))
      }
    }
  }

  pub fn is_due(&self, now: DateTime<Utc>) -> DueStatus {
    let Some(last) = self.scheduled_last_run_at(now) else {
      return DueStatus {
        due: true,
        next_in: self.run_every,
      };
    };
    let elapsed = (now - last).num_milliseconds();
    let remaining = millis(self.run_every).saturating_sub(elapsed).max(0);
    if remaining == 0 {
      DueStatus {
        due: true,
        next_in: self.run_every,
      }
    } else {
      DueStatus {
        due: false,
        next_in: StdDuration::from_millis(remaining.unsigned_abs()),
      }
    }
  }

  /// Records a run at `now`. Call exactly once per due detection.
  pub fn fire(&mut self, now: DateTime<Utc>) {
    self.last_run_at = Some(match self.last_run_at {
      Some(previous) => previous.max(now),
      None => now,
    });
    self.total_run_count += 1;
  }
}

/// All periodic entries of a registry, ordered by job name.
#[derive(Debug, Clone, Default)]
pub struct PeriodicScheduler {
  entries: BTreeMap<String, SchedulerEntry>,
}

impl PeriodicScheduler {
  pub fn from_registry(registry: &JobRegistry) -> Self {
    let entries = registry
      .list(Some(JobKind::Periodic))
      .iter()
      .filter_map(|job| {
        job
          .recurrence()
          .map(|r| (job.name().to_string(), SchedulerEntry::new(job.name(), r)))
      })
      .collect();
    Self { entries }
  }

  pub fn entry(&self, name: &str) -> Option<&SchedulerEntry> {
    self.entries.get(name)
  }

  pub fn entries(&self) -> impl Iterator<Item = &SchedulerEntry> {
    self.entries.values()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Fires every due entry and returns their names, in name order, along with
  /// the shortest wait until any entry is due again.
  pub fn fire_due(&mut self, now: DateTime<Utc>) -> (Vec<String>, Option<StdDuration>) {
    let mut fired = Vec::new();
    let mut next: Option<StdDuration> = None;
    for entry in self.entries.values_mut() {
      let status = entry.is_due(now);
      if status.due {
        entry.fire(now);
        fired.push(entry.name.clone());
      }
      trace!(job = %entry.name, due = status.due, next_in_ms = status.next_in.as_millis() as u64, "Checked periodic entry.");
      next = Some(next.map_or(status.next_in, |n| n.min(status.next_in)));
    }
    (fired, next)
  }

  /// The entry that runs next among `names` (all entries when `None`) and the
  /// time until it is due.
  pub fn next_scheduled(
    &self,
    names: Option<&[&str]>,
    now: DateTime<Utc>,
  ) -> Option<(String, StdDuration)> {
    self
      .entries
      .values()
      .filter(|e| names.map_or(true, |n| n.contains(&e.name.as_str())))
      .map(|e| {
        let status = e.is_due(now);
        let wait = if status.due { StdDuration::ZERO } else { status.next_in };
        (e.name.clone(), wait)
      })
      .min_by_key(|(_, wait)| *wait)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn entry(every_secs: u64, anchor: Option<DateTime<Utc>>) -> SchedulerEntry {
    SchedulerEntry::new(
      "p",
      &Recurrence {
        run_every: StdDuration::from_secs(every_secs),
        anchor,
      },
    )
  }

  fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
  }

  #[test]
  fn interval_without_anchor() {
    let t0 = at(12, 0, 0);
    let mut e = entry(10, None);

    let s = e.is_due(t0);
    assert!(s.due);
    e.fire(t0);

    let s = e.is_due(t0 + Duration::seconds(5));
    assert!(!s.due);
    assert_eq!(s.next_in, StdDuration::from_secs(5));
    assert_eq!(s.seconds_until_next(), 5.0);

    let s = e.is_due(t0 + Duration::seconds(9));
    assert!(!s.due);
    assert_eq!(s.next_in, StdDuration::from_secs(1));

    let s = e.is_due(t0 + Duration::seconds(11));
    assert!(s.due);
    assert_eq!(s.next_in, StdDuration::from_secs(10));
    e.fire(t0 + Duration::seconds(11));
    assert_eq!(e.total_run_count, 2);
  }

  #[test]
  fn anchor_aligns_to_wall_clock() {
    // Every hour on minute 25, process started at 10:40.
    let mut e = entry(3600, Some(at(0, 25, 0)));

    let s = e.is_due(at(10, 40, 0));
    assert!(!s.due);
    assert_eq!(s.next_in, StdDuration::from_secs(45 * 60));
    assert!(!e.is_due(at(11, 24, 59)).due);
    assert!(e.is_due(at(11, 25, 0)).due);

    // Fired slightly late; the next run is still on minute 25.
    e.fire(at(11, 25, 3));
    let s = e.is_due(at(11, 30, 0));
    assert!(!s.due);
    assert_eq!(s.next_in, StdDuration::from_secs(55 * 60));
    assert!(!e.is_due(at(12, 24, 59)).due);
    assert!(e.is_due(at(12, 25, 0)).due);
  }

  #[test]
  fn anchor_in_the_future() {
    let e = entry(3600, Some(at(18, 25, 0)));
    let s = e.is_due(at(10, 40, 0));
    assert!(!s.due);
    assert_eq!(s.next_in, StdDuration::from_secs(45 * 60));
  }

  #[test]
  fn huge_interval_does_not_overflow() {
    let huge = StdDuration::from_millis(i64::MAX as u64);
    let mut e = SchedulerEntry::new(
      "p",
      &Recurrence {
        run_every: huge,
        anchor: Some(at(18, 25, 0)),
      },
    );
    // No boundary before the anchor is representable: due like a fresh entry.
    assert_eq!(e.scheduled_last_run_at(at(10, 40, 0)), None);
    assert!(e.is_due(at(10, 40, 0)).due);

    e.fire(at(10, 40, 0));
    assert_eq!(e.scheduled_last_run_at(at(10, 41, 0)), Some(at(10, 40, 0)));
    let s = e.is_due(at(10, 41, 0));
    assert!(!s.due);
    assert!(s.next_in > StdDuration::from_secs(3600));
  }

  #[test]
  fn fire_is_monotonic() {
    let mut e = entry(10, None);
    e.fire(at(12, 0, 10));
    e.fire(at(12, 0, 5));
    assert_eq!(e.last_run_at, Some(at(12, 0, 10)));
    assert_eq!(e.total_run_count, 2);
  }

  #[test]
  fn fire_due_orders_by_name_and_reports_minimum() {
    let mut scheduler = PeriodicScheduler::default();
    for (name, secs) in [("b", 10), ("a", 30)] {
      let mut e = entry(secs, None);
      e.name = name.to_string();
      scheduler.entries.insert(name.to_string(), e);
    }

    let t0 = at(12, 0, 0);
    let (fired, next) = scheduler.fire_due(t0);
    assert_eq!(fired, vec!["a", "b"]);
    assert_eq!(next, Some(StdDuration::from_secs(10)));

    let (fired, next) = scheduler.fire_due(t0 + Duration::seconds(4));
    assert!(fired.is_empty());
    assert_eq!(next, Some(StdDuration::from_secs(6)));

    let (name, wait) = scheduler.next_scheduled(None, t0 + Duration::seconds(4)).unwrap();
    assert_eq!((name.as_str(), wait), ("b", StdDuration::from_secs(6)));
    let (name, _) = scheduler
      .next_scheduled(Some(&["a"]), t0 + Duration::seconds(4))
      .unwrap();
    assert_eq!(name, "a");
  }
}
