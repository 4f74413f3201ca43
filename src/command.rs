use crate::task::{TaskId, TaskStatus};

use std::time::Duration;

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the backend is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop polling and wait for in-flight tasks to finish.
  Graceful,
  /// Stop polling and revoke in-flight tasks.
  Force,
}

/// Message sent from an execution back to the poll loop once a dispatched task
/// left this backend's in-flight set.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionOutcome {
  pub task_id: TaskId,
  /// `RETRY` when the task went back to the queue, otherwise its terminal status.
  pub status: TaskStatus,
  pub duration: Duration,
}
