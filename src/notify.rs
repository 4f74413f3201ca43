//! Lifecycle event broadcasting.

use crate::error::NotifyError;
use crate::task::TaskId;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Stream of task ids published on one channel.
pub type TaskIdStream = Pin<Box<dyn Stream<Item = TaskId> + Send + 'static>>;

/// The three lifecycle events a backend publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
  Created,
  Started,
  Done,
}

impl LifecycleEvent {
  pub fn suffix(self) -> &'static str {
    match self {
      LifecycleEvent::Created => "task_created",
      LifecycleEvent::Started => "task_start",
      LifecycleEvent::Done => "task_done",
    }
  }

  /// Channel name scoped by the backend name, e.g. `taskqueue_task_done`.
  pub fn channel(self, backend_name: &str) -> String {
    format!("{}_{}", backend_name, self.suffix())
  }
}

impl fmt::Display for LifecycleEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.suffix())
  }
}

/// Publish/subscribe transport for lifecycle events.
///
/// Delivery is at-least-once per live subscriber; subscribers re-fetch the task
/// by id, so duplicates are harmless.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
  async fn publish(&self, channel: &str, task_id: TaskId) -> Result<(), NotifyError>;

  /// Receives ids published on `channel` after this call returns.
  async fn subscribe(&self, channel: &str) -> Result<TaskIdStream, NotifyError>;
}

/// In-process [`Notifier`] backed by one `tokio::sync::broadcast` channel per name.
#[derive(Debug)]
pub struct LocalNotifier {
  capacity: usize,
  channels: Mutex<HashMap<String, broadcast::Sender<TaskId>>>,
}

impl LocalNotifier {
  pub fn new() -> Self {
    Self::with_capacity(1024)
  }

  /// `capacity` bounds how far a slow subscriber may lag before it skips ids.
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      channels: Mutex::new(HashMap::new()),
    }
  }

  fn sender(&self, channel: &str) -> broadcast::Sender<TaskId> {
    self
      .channels
      .lock()
      .entry(channel.to_string())
      .or_insert_with(|| broadcast::channel(self.capacity).0)
      .clone()
  }
}

impl Default for LocalNotifier {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Notifier for LocalNotifier {
  async fn publish(&self, channel: &str, task_id: TaskId) -> Result<(), NotifyError> {
    // No subscribers is not an error.
    let receivers = self.sender(channel).send(task_id).unwrap_or(0);
    trace!(channel, %task_id, receivers, "Published lifecycle event.");
    Ok(())
  }

  async fn subscribe(&self, channel: &str) -> Result<TaskIdStream, NotifyError> {
    let rx = self.sender(channel).subscribe();
    let channel = channel.to_string();
    let ids = stream::unfold((rx, channel), |(mut rx, channel)| async move {
      loop {
        match rx.recv().await {
          Ok(id) => return Some((id, (rx, channel))),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(channel = %channel, skipped, "Lifecycle subscriber lagged, ids dropped.");
          }
          Err(broadcast::error::RecvError::Closed) => return None,
        }
      }
    });
    Ok(Box::pin(ids))
  }
}
