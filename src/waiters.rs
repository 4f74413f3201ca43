use crate::task::{Task, TaskId};

use std::collections::HashMap;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

/// Completion handle shared by every local caller waiting on the same task.
pub(crate) type Completion = Shared<oneshot::Receiver<Task>>;

/// Process-local map of task id -> pending completion.
///
/// One entry per task id; concurrent waiters share it and are released together,
/// exactly once.
#[derive(Default)]
pub(crate) struct Waiters {
  pending: Mutex<HashMap<TaskId, (oneshot::Sender<Task>, Completion)>>,
}

impl Waiters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the completion handle for `task_id`, creating it if needed.
  pub fn register(&self, task_id: TaskId) -> Completion {
    self
      .pending
      .lock()
      .entry(task_id)
      .or_insert_with(|| {
        let (tx, rx) = oneshot::channel();
        (tx, rx.shared())
      })
      .1
      .clone()
  }

  /// Resolves the waiters of a terminal task. Returns `false` if nobody was waiting.
  pub fn release(&self, task: &Task) -> bool {
    let entry = self.pending.lock().remove(&task.id);
    match entry {
      Some((tx, _)) => {
        trace!(task_id = %task.id, "Releasing task waiters.");
        let _ = tx.send(task.clone());
        true
      }
      None => false,
    }
  }

  /// Drops the entry for `task_id`; its waiters observe an abandoned handle.
  pub fn forget(&self, task_id: TaskId) {
    self.pending.lock().remove(&task_id);
  }

  /// Drops the entry for `task_id` once no local caller holds its handle any
  /// more. Call after the caller's own handle was dropped.
  pub fn forget_unshared(&self, task_id: TaskId) -> bool {
    let mut pending = self.pending.lock();
    let unshared = pending
      .get(&task_id)
      .is_some_and(|(_, completion)| completion.strong_count().map_or(true, |n| n <= 1));
    if unshared {
      trace!(%task_id, "Dropping abandoned wait entry.");
      pending.remove(&task_id);
    }
    unshared
  }

  pub fn is_waiting(&self, task_id: TaskId) -> bool {
    self.pending.lock().contains_key(&task_id)
  }

  pub fn len(&self) -> usize {
    self.pending.lock().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::JobArgs;
  use crate::task::TaskMeta;
  use chrono::Utc;

  #[tokio::test]
  async fn shared_wait_is_released_once() {
    let waiters = Waiters::new();
    let task = Task::new("a", JobArgs::new(), None, Utc::now(), None, TaskMeta::new());

    let first = waiters.register(task.id);
    let second = waiters.register(task.id);
    assert_eq!(waiters.len(), 1);

    assert!(waiters.release(&task));
    assert!(!waiters.release(&task));
    assert!(!waiters.is_waiting(task.id));

    assert_eq!(first.await.unwrap().id, task.id);
    assert_eq!(second.await.unwrap().id, task.id);
  }

  #[test]
  fn stale_entry_dropped_after_last_waiter() {
    let waiters = Waiters::new();
    let id = uuid::Uuid::new_v4();
    let first = waiters.register(id);
    let second = waiters.register(id);

    drop(first);
    assert!(!waiters.forget_unshared(id));
    assert!(waiters.is_waiting(id));

    drop(second);
    assert!(waiters.forget_unshared(id));
    assert_eq!(waiters.len(), 0);
  }

  #[tokio::test]
  async fn forgotten_handle_is_abandoned() {
    let waiters = Waiters::new();
    let id = uuid::Uuid::new_v4();
    let handle = waiters.register(id);
    waiters.forget(id);
    assert!(handle.await.is_err());
  }
}
