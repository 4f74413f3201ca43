use crate::task::TaskId;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while building a backend with `TaskBackendBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Backlog (`backlog`) must be greater than zero")]
  ZeroBacklog,
  #[error("Backend name must not be empty")]
  EmptyName,
  #[error("Invalid periodic job {0}: run_every must be greater than zero")]
  InvalidPeriodicJob(String),
}

/// Errors raised while populating a `JobRegistry`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("Job {0} is already registered.")]
  DuplicateJob(String),
  #[error("Periodic job {0} must have a positive run_every interval.")]
  InvalidRunEvery(String),
}

/// Errors surfaced by the task store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("Task {0} not found in store.")]
  NotFound(TaskId),
  /// A live (non-terminal) task already holds the overlap key.
  #[error("Overlap key {overlap_id} is held by task {holder}.")]
  OverlapTaken { overlap_id: String, holder: TaskId },
  #[error("Task store unavailable: {0}")]
  Unavailable(String),
  #[error("Task store serialization failure: {0}")]
  Serialization(String),
}

/// Errors surfaced by the lifecycle notifier collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
  #[error("Notifier is closed.")]
  Closed,
  #[error("Notifier transport failure: {0}")]
  Transport(String),
}

/// Errors related to submitting jobs via `TaskBackend::submit`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
  #[error("Job {0} is not registered.")]
  JobNotFound(String),
  #[error("Backend is shutting down, submission rejected.")]
  ShuttingDown,
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors related to querying task state or job information.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("Task {0} not found.")]
  TaskNotFound(TaskId),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors returned by `TaskBackend::wait_for_task`.
///
/// A timeout is purely local: the task keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
  #[error("Timed out after {timeout:?} waiting for task {task_id}.")]
  Timeout { task_id: TaskId, timeout: Duration },
  #[error("Task {0} not found.")]
  TaskNotFound(TaskId),
  #[error("Completion handle for task {0} was dropped before the task finished.")]
  Abandoned(TaskId),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors related to the backend shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (backend already shut down).")]
  SignalFailed,
  #[error("Timed out waiting for backend loops and in-flight tasks to complete shutdown.")]
  Timeout,
  #[error("A backend loop panicked during the shutdown process.")]
  TaskPanic,
}

/// Error returned by a job body.
///
/// `Retry` asks the backend to re-queue the task if the job still has retries left;
/// otherwise it is recorded exactly like `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("{0}")]
  Failed(String),
  #[error("retry requested: {0}")]
  Retry(String),
}

impl JobError {
  pub fn failed(msg: impl std::fmt::Display) -> Self {
    JobError::Failed(msg.to_string())
  }

  pub fn retry(msg: impl std::fmt::Display) -> Self {
    JobError::Retry(msg.to_string())
  }
}

impl From<serde_json::Error> for JobError {
  fn from(err: serde_json::Error) -> Self {
    JobError::Failed(format!("invalid job arguments: {}", err))
  }
}

/// Reasons a task execution ended without the job body returning.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
  /// The task's expiry deadline elapsed before or during execution.
  #[error("task exceeded its expiry deadline")]
  TaskTimeout,
  #[error("task was revoked")]
  Revoked,
  #[error("job body panicked: {0}")]
  Panicked(String),
  #[error("job execution was cancelled by the worker pool")]
  Cancelled,
}
