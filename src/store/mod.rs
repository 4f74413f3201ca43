//! Task record storage.
//!
//! The backend only talks to storage through [`TaskStore`]. Several backends
//! may share one store; the store is responsible for handing each queued task
//! to at most one of them.

pub mod memory;

pub use memory::InMemoryTaskStore;

use crate::error::StoreError;
use crate::task::{Task, TaskFilter, TaskId, TaskStatus, TaskUpdate};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
  /// Persists a new task.
  ///
  /// Fails with [`StoreError::OverlapTaken`] if a non-terminal task already holds
  /// the task's overlap id. Creating a task whose id is already stored returns
  /// the stored record unchanged.
  async fn create(&self, task: Task) -> Result<Task, StoreError>;

  async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

  /// Takes the next queued task, waiting up to `timeout` for one to arrive.
  /// A queued task is returned by at most one call.
  async fn get_next_ready(&self, timeout: Duration) -> Result<Option<Task>, StoreError>;

  /// Moves a `PENDING` or `RETRY` task to `QUEUED` and makes it available to
  /// [`get_next_ready`](Self::get_next_ready). Returns `None` for any other status.
  async fn enqueue(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

  /// Hands a task taken by [`get_next_ready`](Self::get_next_ready) but never
  /// started back to the queue, ahead of tasks queued after it. Returns `false`
  /// if the task is no longer `QUEUED`.
  async fn requeue(&self, id: TaskId) -> Result<bool, StoreError>;

  async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

  /// Applies `update` unconditionally.
  async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, StoreError>;

  /// Applies `update` only if the task's current status is one of `allowed`.
  async fn update_if(
    &self,
    id: TaskId,
    allowed: &[TaskStatus],
    update: TaskUpdate,
  ) -> Result<Option<Task>, StoreError>;

  /// Applies a terminal update unless the task is already terminal, and releases
  /// the task's overlap id. Returns `None` when the task was already terminal.
  async fn finish(&self, id: TaskId, update: TaskUpdate) -> Result<Option<Task>, StoreError>;

  /// Deletes the given tasks and returns the ids that existed.
  async fn delete(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, StoreError>;

  /// Number of tasks waiting to be started (`PENDING`, `QUEUED` or `RETRY`).
  async fn count_pending(&self) -> Result<usize, StoreError>;

  /// Removes every task.
  async fn flush(&self) -> Result<(), StoreError>;
}

/// Marks a queued task `STARTED` by `worker`, unless another party moved it on.
pub(crate) async fn start_task(
  store: &dyn TaskStore,
  id: TaskId,
  worker: &str,
  at: DateTime<Utc>,
) -> Result<Option<Task>, StoreError> {
  store
    .update_if(
      id,
      &[TaskStatus::Pending, TaskStatus::Queued],
      TaskUpdate::new()
        .with_status(TaskStatus::Started)
        .with_time_started(at)
        .with_worker(worker),
    )
    .await
}
