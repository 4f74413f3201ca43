use crate::task::TaskStatus;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of recorded durations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Atomic counters shared by a backend's loops and executions.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct BackendMetrics {
  // --- Counters ---
  /// Tasks created by `submit` (periodic submissions included).
  pub tasks_submitted: Arc<AtomicUsize>,
  /// Submissions that returned an existing task because of overlap.
  pub tasks_suppressed: Arc<AtomicUsize>,
  pub tasks_started: Arc<AtomicUsize>,
  pub tasks_succeeded: Arc<AtomicUsize>,
  pub tasks_failed: Arc<AtomicUsize>,
  pub tasks_revoked: Arc<AtomicUsize>,
  pub tasks_retried: Arc<AtomicUsize>,
  /// Job bodies that panicked. Also counted in `tasks_failed`.
  pub tasks_panicked: Arc<AtomicUsize>,
  pub periodic_fired: Arc<AtomicUsize>,
  /// Poll cycles that failed with a store error.
  pub poll_errors: Arc<AtomicUsize>,
  /// Poll cycles skipped because the backlog was full.
  pub backlog_skips: Arc<AtomicUsize>,

  // --- Gauges ---
  pub tasks_in_flight: Arc<AtomicUsize>,

  // --- Histograms ---
  pub task_execution_duration: Arc<SimpleHistogram>,
}

impl BackendMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Counts a task that reached `status` on this backend.
  pub(crate) fn record_finished(&self, status: TaskStatus) {
    match status {
      TaskStatus::Success => Self::incr(&self.tasks_succeeded),
      TaskStatus::Failure => Self::incr(&self.tasks_failed),
      TaskStatus::Revoked => Self::incr(&self.tasks_revoked),
      _ => {}
    }
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      tasks_submitted: self.tasks_submitted.load(order),
      tasks_suppressed: self.tasks_suppressed.load(order),
      tasks_started: self.tasks_started.load(order),
      tasks_succeeded: self.tasks_succeeded.load(order),
      tasks_failed: self.tasks_failed.load(order),
      tasks_revoked: self.tasks_revoked.load(order),
      tasks_retried: self.tasks_retried.load(order),
      tasks_panicked: self.tasks_panicked.load(order),
      periodic_fired: self.periodic_fired.load(order),
      poll_errors: self.poll_errors.load(order),
      backlog_skips: self.backlog_skips.load(order),
      tasks_in_flight: self.tasks_in_flight.load(order),
      task_execution_duration_count: self.task_execution_duration.get_count(),
      task_execution_duration_sum_micros: self.task_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// Point-in-time copy of a backend's metrics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub tasks_submitted: usize,
  pub tasks_suppressed: usize,
  pub tasks_started: usize,
  pub tasks_succeeded: usize,
  pub tasks_failed: usize,
  pub tasks_revoked: usize,
  pub tasks_retried: usize,
  pub tasks_panicked: usize,
  pub periodic_fired: usize,
  pub poll_errors: usize,
  pub backlog_skips: usize,
  // Gauges
  pub tasks_in_flight: usize,
  // Histogram Data
  pub task_execution_duration_count: usize,
  pub task_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean execution time of finished tasks, `None` before the first one.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.task_execution_duration_count == 0 {
      None
    } else {
      let mean = self.task_execution_duration_sum_micros / self.task_execution_duration_count;
      Some(Duration::from_micros(mean as u64))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_reflects_counters() {
    let metrics = BackendMetrics::new();
    BackendMetrics::incr(&metrics.tasks_submitted);
    metrics.record_finished(TaskStatus::Success);
    metrics.record_finished(TaskStatus::Revoked);
    metrics.record_finished(TaskStatus::Retry);
    metrics.task_execution_duration.record(Duration::from_millis(2));
    metrics.task_execution_duration.record(Duration::from_millis(4));

    let snap = metrics.clone().snapshot();
    assert_eq!(snap.tasks_submitted, 1);
    assert_eq!(snap.tasks_succeeded, 1);
    assert_eq!(snap.tasks_revoked, 1);
    assert_eq!(snap.tasks_failed, 0);
    assert_eq!(snap.mean_execution_duration(), Some(Duration::from_millis(3)));
    assert_eq!(MetricsSnapshot::default().mean_execution_duration(), None);
  }
}
