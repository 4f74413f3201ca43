use crate::job::JobArgs;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Type alias for the unique identifier of a task.
/// Uses UUID v4, generated once at submission time.
pub type TaskId = Uuid;

/// Lifecycle status of a [`Task`].
///
/// `PENDING -> QUEUED -> STARTED -> {SUCCESS, FAILURE, REVOKED}`, with `RETRY`
/// as a transient state between a failed attempt and the task being re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Pending,
  Queued,
  Started,
  Retry,
  Success,
  Failure,
  Revoked,
}

impl TaskStatus {
  /// Numeric precedence; lower values are further along the lifecycle.
  pub fn precedence(self) -> u8 {
    match self {
      TaskStatus::Success => 1,
      TaskStatus::Failure => 2,
      TaskStatus::Revoked => 3,
      TaskStatus::Retry => 4,
      TaskStatus::Started => 5,
      TaskStatus::Queued => 6,
      TaskStatus::Pending => 7,
    }
  }

  /// `SUCCESS`, `FAILURE` and `REVOKED`. No transition leaves these.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
    )
  }

  /// The task body actually ran to an outcome.
  pub fn has_run(self) -> bool {
    matches!(self, TaskStatus::Success | TaskStatus::Failure)
  }

  /// Statuses from which a backend may start executing the task.
  pub fn can_start(self) -> bool {
    self.precedence() > TaskStatus::Started.precedence()
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "PENDING",
      TaskStatus::Queued => "QUEUED",
      TaskStatus::Started => "STARTED",
      TaskStatus::Retry => "RETRY",
      TaskStatus::Success => "SUCCESS",
      TaskStatus::Failure => "FAILURE",
      TaskStatus::Revoked => "REVOKED",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What a finished task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskResult {
  /// Return value of a successful job body.
  Value(Value),
  /// Description of the error a failed job body produced.
  Error(String),
}

impl TaskResult {
  pub fn value(&self) -> Option<&Value> {
    match self {
      TaskResult::Value(v) => Some(v),
      TaskResult::Error(_) => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      TaskResult::Value(_) => None,
      TaskResult::Error(e) => Some(e),
    }
  }
}

/// Submission metadata that is stored on the task but not passed to the job body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
  /// The task that queued this one, if submitted from inside a job body.
  pub from_task: Option<TaskId>,
  /// Overrides the expiry derived from the job's timeout.
  pub expiry: Option<DateTime<Utc>>,
  /// Free-form caller metadata.
  pub extra: BTreeMap<String, Value>,
}

impl TaskMeta {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_from_task(mut self, task_id: TaskId) -> Self {
    self.from_task = Some(task_id);
    self
  }

  pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
    self.expiry = Some(expiry);
    self
  }

  pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.extra.insert(key.to_string(), value.into());
    self
  }
}

/// One invocation of a job, as persisted by the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: TaskId,
  /// Deduplication key; `None` when the job allows overlapping tasks.
  pub overlap_id: Option<String>,
  /// Name of the job this task invokes.
  pub name: String,
  pub args: JobArgs,
  pub status: TaskStatus,
  pub time_created: DateTime<Utc>,
  pub time_queued: Option<DateTime<Utc>>,
  pub time_started: Option<DateTime<Utc>>,
  pub time_ended: Option<DateTime<Utc>>,
  /// Absolute deadline. Not started by then means `REVOKED`.
  pub expiry: Option<DateTime<Utc>>,
  pub result: Option<TaskResult>,
  /// Number of times the task went through `RETRY`.
  pub retries: u32,
  /// Id of the backend that started the task.
  pub worker: Option<String>,
  pub from_task: Option<TaskId>,
  pub meta: BTreeMap<String, Value>,
}

impl Task {
  pub(crate) fn new(
    name: &str,
    args: JobArgs,
    overlap_id: Option<String>,
    created: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
    meta: TaskMeta,
  ) -> Self {
    Self {
      id: Uuid::new_v4(),
      overlap_id,
      name: name.to_string(),
      args,
      status: TaskStatus::Pending,
      time_created: created,
      time_queued: None,
      time_started: None,
      time_ended: None,
      expiry,
      result: None,
      retries: 0,
      worker: None,
      from_task: meta.from_task,
      meta: meta.extra,
    }
  }

  /// `true` once the task reached a terminal status.
  pub fn is_done(&self) -> bool {
    self.status.is_terminal()
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expiry.is_some_and(|expiry| now > expiry)
  }

  /// Short description used in log lines, e.g. `task.add(3f2a...)`.
  pub fn info(&self) -> String {
    format!("task.{}({})", self.name, self.id)
  }

  /// Applies a partial update in place. Stores call this under their own lock.
  pub fn apply(&mut self, update: &TaskUpdate) {
    if let Some(status) = update.status {
      self.status = status;
    }
    if let Some(t) = update.time_queued {
      self.time_queued = Some(t);
    }
    if let Some(t) = update.time_started {
      self.time_started = Some(t);
    }
    if let Some(t) = update.time_ended {
      self.time_ended = Some(t);
    }
    if let Some(result) = &update.result {
      self.result = Some(result.clone());
    }
    if let Some(retries) = update.retries {
      self.retries = retries;
    }
    if let Some(worker) = &update.worker {
      self.worker = Some(worker.clone());
    }
    if update.clear_overlap {
      self.overlap_id = None;
    }
  }
}

impl fmt::Display for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let id = self.id.to_string();
    let when = self
      .time_ended
      .or(self.time_started)
      .unwrap_or(self.time_created);
    write!(
      f,
      "{} ({}) {} at {}",
      self.name,
      &id[..8],
      self.status,
      when.to_rfc3339()
    )
  }
}

/// Partial update applied to a stored task. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
  pub status: Option<TaskStatus>,
  pub time_queued: Option<DateTime<Utc>>,
  pub time_started: Option<DateTime<Utc>>,
  pub time_ended: Option<DateTime<Utc>>,
  pub result: Option<TaskResult>,
  pub retries: Option<u32>,
  pub worker: Option<String>,
  /// Drop the task's overlap key so a new submission may take it.
  pub clear_overlap: bool,
}

impl TaskUpdate {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_status(mut self, status: TaskStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn with_time_queued(mut self, t: DateTime<Utc>) -> Self {
    self.time_queued = Some(t);
    self
  }

  pub fn with_time_started(mut self, t: DateTime<Utc>) -> Self {
    self.time_started = Some(t);
    self
  }

  pub fn with_time_ended(mut self, t: DateTime<Utc>) -> Self {
    self.time_ended = Some(t);
    self
  }

  pub fn with_result(mut self, result: TaskResult) -> Self {
    self.result = Some(result);
    self
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = Some(retries);
    self
  }

  pub fn with_worker(mut self, worker: &str) -> Self {
    self.worker = Some(worker.to_string());
    self
  }

  pub fn clearing_overlap(mut self) -> Self {
    self.clear_overlap = true;
    self
  }
}

/// Selection criteria for `TaskStore::list`. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
  pub ids: Option<Vec<TaskId>>,
  pub names: Option<Vec<String>>,
  pub statuses: Option<Vec<TaskStatus>>,
  pub overlap_id: Option<String>,
}

impl TaskFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_ids(mut self, ids: Vec<TaskId>) -> Self {
    self.ids = Some(ids);
    self
  }

  pub fn with_name(mut self, name: &str) -> Self {
    self.names.get_or_insert_with(Vec::new).push(name.to_string());
    self
  }

  pub fn with_status(mut self, status: TaskStatus) -> Self {
    self.statuses.get_or_insert_with(Vec::new).push(status);
    self
  }

  pub fn with_overlap_id(mut self, overlap_id: &str) -> Self {
    self.overlap_id = Some(overlap_id.to_string());
    self
  }

  pub fn matches(&self, task: &Task) -> bool {
    if let Some(ids) = &self.ids {
      if !ids.contains(&task.id) {
        return false;
      }
    }
    if let Some(names) = &self.names {
      if !names.iter().any(|n| *n == task.name) {
        return false;
      }
    }
    if let Some(statuses) = &self.statuses {
      if !statuses.contains(&task.status) {
        return false;
      }
    }
    if let Some(overlap_id) = &self.overlap_id {
      if task.overlap_id.as_deref() != Some(overlap_id.as_str()) {
        return false;
      }
    }
    true
  }
}

/// Derives the deduplication key for a job invocation.
///
/// The key depends only on the job name and the canonical form of its arguments,
/// so equal submissions map to the same key in every process.
pub fn overlap_id(job_name: &str, args: &JobArgs) -> String {
  let mut hasher = Sha256::new();
  hasher.update(job_name.as_bytes());
  hasher.update(b"\n");
  hasher.update(args.canonical().as_bytes());
  hasher
    .finalize()
    .iter()
    .map(|b| format!("{:02x}", b))
    .collect()
}
