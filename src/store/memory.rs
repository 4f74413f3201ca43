use crate::error::StoreError;
use crate::store::TaskStore;
use crate::task::{Task, TaskFilter, TaskId, TaskStatus, TaskUpdate};

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct StoreState {
  tasks: HashMap<TaskId, Task>,
  /// Overlap id -> task currently holding it.
  overlaps: HashMap<String, TaskId>,
  /// Queued task ids, oldest first.
  ready: VecDeque<TaskId>,
}

impl StoreState {
  fn release_overlap(&mut self, task_id: TaskId, overlap_id: Option<&str>) {
    if let Some(key) = overlap_id {
      if self.overlaps.get(key) == Some(&task_id) {
        self.overlaps.remove(key);
      }
    }
  }
}

/// Process-local [`TaskStore`].
///
/// Shared by every backend holding the same `Arc`, which is enough to run
/// several backends against one queue inside a single process.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
  state: Mutex<StoreState>,
  ready_signal: Notify,
}

impl InMemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Deletes terminal tasks that ended before `older_than`, returning their ids.
  pub fn purge_finished(&self, older_than: DateTime<Utc>) -> Vec<TaskId> {
    let mut state = self.state.lock();
    let stale: Vec<TaskId> = state
      .tasks
      .values()
      .filter(|t| t.is_done() && t.time_ended.is_some_and(|ended| ended < older_than))
      .map(|t| t.id)
      .collect();
    for id in &stale {
      if let Some(task) = state.tasks.remove(id) {
        state.release_overlap(task.id, task.overlap_id.as_deref());
      }
    }
    debug!(purged = stale.len(), "Purged finished tasks.");
    stale
  }

  pub fn len(&self) -> usize {
    self.state.lock().tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.lock().tasks.is_empty()
  }

  fn pop_ready(&self) -> Option<Task> {
    let mut state = self.state.lock();
    while let Some(id) = state.ready.pop_front() {
      // Entries for deleted or revoked tasks are skipped.
      match state.tasks.get(&id) {
        Some(task) if task.status == TaskStatus::Queued => return Some(task.clone()),
        _ => trace!(task_id = %id, "Skipping stale ready entry."),
      }
    }
    None
  }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
  async fn create(&self, task: Task) -> Result<Task, StoreError> {
    let mut state = self.state.lock();
    if let Some(existing) = state.tasks.get(&task.id) {
      return Ok(existing.clone());
    }
    if let Some(key) = &task.overlap_id {
      if let Some(holder) = state.overlaps.get(key).copied() {
        let live = state.tasks.get(&holder).is_some_and(|t| !t.is_done());
        if live {
          return Err(StoreError::OverlapTaken {
            overlap_id: key.clone(),
            holder,
          });
        }
      }
      state.overlaps.insert(key.clone(), task.id);
    }
    state.tasks.insert(task.id, task.clone());
    Ok(task)
  }

  async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
    Ok(self.state.lock().tasks.get(&id).cloned())
  }

  async fn get_next_ready(&self, timeout: Duration) -> Result<Option<Task>, StoreError> {
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(task) = self.pop_ready() {
        return Ok(Some(task));
      }
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Ok(None);
      }
      if tokio::time::timeout(remaining, self.ready_signal.notified())
        .await
        .is_err()
      {
        return Ok(None);
      }
    }
  }

  async fn enqueue(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
    let queued = {
      let mut state = self.state.lock();
      let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
      if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retry) {
        return Ok(None);
      }
      task.status = TaskStatus::Queued;
      task.time_queued = Some(Utc::now());
      let queued = task.clone();
      state.ready.push_back(id);
      queued
    };
    self.ready_signal.notify_one();
    Ok(Some(queued))
  }

  async fn requeue(&self, id: TaskId) -> Result<bool, StoreError> {
    {
      let mut state = self.state.lock();
      let task = state.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
      if task.status != TaskStatus::Queued {
        return Ok(false);
      }
      if !state.ready.contains(&id) {
        state.ready.push_front(id);
      }
    }
    self.ready_signal.notify_one();
    Ok(true)
  }

  async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
    let state = self.state.lock();
    let mut tasks: Vec<Task> = state
      .tasks
      .values()
      .filter(|t| filter.matches(t))
      .cloned()
      .collect();
    tasks.sort_by_key(|t| t.time_created);
    Ok(tasks)
  }

  async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, StoreError> {
    let mut state = self.state.lock();
    let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    let previous_overlap = task.overlap_id.clone();
    task.apply(&update);
    let updated = task.clone();
    if update.clear_overlap {
      state.release_overlap(id, previous_overlap.as_deref());
    }
    Ok(updated)
  }

  async fn update_if(
    &self,
    id: TaskId,
    allowed: &[TaskStatus],
    update: TaskUpdate,
  ) -> Result<Option<Task>, StoreError> {
    let mut state = self.state.lock();
    let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    if !allowed.contains(&task.status) {
      return Ok(None);
    }
    task.apply(&update);
    Ok(Some(task.clone()))
  }

  async fn finish(&self, id: TaskId, update: TaskUpdate) -> Result<Option<Task>, StoreError> {
    let mut state = self.state.lock();
    let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    if task.is_done() {
      return Ok(None);
    }
    task.apply(&update);
    let finished = task.clone();
    state.release_overlap(id, finished.overlap_id.as_deref());
    Ok(Some(finished))
  }

  async fn delete(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, StoreError> {
    let mut state = self.state.lock();
    let mut deleted = Vec::with_capacity(ids.len());
    for id in ids {
      if let Some(task) = state.tasks.remove(id) {
        state.release_overlap(task.id, task.overlap_id.as_deref());
        deleted.push(task.id);
      }
    }
    Ok(deleted)
  }

  async fn count_pending(&self) -> Result<usize, StoreError> {
    let state = self.state.lock();
    Ok(
      state
        .tasks
        .values()
        .filter(|t| {
          matches!(
            t.status,
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retry
          )
        })
        .count(),
    )
  }

  async fn flush(&self) -> Result<(), StoreError> {
    let mut state = self.state.lock();
    state.tasks.clear();
    state.overlaps.clear();
    state.ready.clear();
    Ok(())
  }
}
