#[cfg(feature = "job_context")]
pub mod context;

use crate::error::JobError;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Public Type Aliases ---

/// Outcome of a job body: a JSON value on success, a [`JobError`] otherwise.
pub type JobResult = Result<Value, JobError>;

/// The future a job body returns.
pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send + 'static>>;

/// The function type that jobs execute.
///
/// It receives the task's call payload and returns a `Future` resolving to a
/// [`JobResult`]. Panics are caught by the worker pool and recorded as failures.
pub type BoxedJobFn = Box<dyn Fn(JobArgs) -> JobFuture + Send + Sync + 'static>;

/// Predicate deciding whether a submission with the given arguments may overlap
/// with a live task of the same job.
pub type OverlapPredicate = Arc<dyn Fn(&JobArgs) -> bool + Send + Sync + 'static>;

/// Boxes a job body future. Used by the `job_fn!` macro.
#[doc(hidden)]
pub fn box_job_future<F>(fut: F) -> JobFuture
where
  F: Future<Output = JobResult> + Send + 'static,
{
  Box::pin(fut)
}

// --- Call Payload ---

/// Positional and keyword arguments of a task.
///
/// Keyword arguments are kept sorted so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
  pub args: Vec<Value>,
  pub kwargs: BTreeMap<String, Value>,
}

impl JobArgs {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a positional argument.
  pub fn arg(mut self, value: impl Into<Value>) -> Self {
    self.args.push(value.into());
    self
  }

  /// Sets a keyword argument.
  pub fn kwarg(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.kwargs.insert(key.to_string(), value.into());
    self
  }

  /// Deserializes the positional argument at `index`.
  pub fn positional<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
    let value = self
      .args
      .get(index)
      .ok_or_else(|| JobError::failed(format!("missing positional argument {}", index)))?;
    Ok(serde_json::from_value(value.clone())?)
  }

  /// Deserializes the keyword argument `key`, if present.
  pub fn keyword<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, JobError> {
    match self.kwargs.get(key) {
      Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
      None => Ok(None),
    }
  }

  /// Canonical string form, used to derive overlap ids.
  pub fn canonical(&self) -> String {
    // Value maps are ordered, so nested objects serialize deterministically too.
    serde_json::to_string(self).unwrap_or_default()
  }
}

// --- Job Definition ---

/// Kind of a job, used to filter the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
  Regular,
  Periodic,
}

impl fmt::Display for JobKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobKind::Regular => f.write_str("regular"),
      JobKind::Periodic => f.write_str("periodic"),
    }
  }
}

/// Whether a job may have several live tasks for the same arguments.
#[derive(Clone, Default)]
pub enum OverlapPolicy {
  /// Every submission creates a new task.
  #[default]
  Allow,
  /// A submission is suppressed while an equivalent task is not terminal.
  Deny,
  /// Decided per submission; `true` means the submission may overlap.
  Predicate(OverlapPredicate),
}

impl OverlapPolicy {
  pub fn predicate<F>(f: F) -> Self
  where
    F: Fn(&JobArgs) -> bool + Send + Sync + 'static,
  {
    OverlapPolicy::Predicate(Arc::new(f))
  }

  pub fn can_overlap(&self, args: &JobArgs) -> bool {
    match self {
      OverlapPolicy::Allow => true,
      OverlapPolicy::Deny => false,
      OverlapPolicy::Predicate(f) => f(args),
    }
  }

  /// `yes`, `no`, or `maybe` for predicates.
  pub fn describe(&self) -> &'static str {
    match self {
      OverlapPolicy::Allow => "yes",
      OverlapPolicy::Deny => "no",
      OverlapPolicy::Predicate(_) => "maybe",
    }
  }
}

impl fmt::Debug for OverlapPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OverlapPolicy::Allow => f.write_str("Allow"),
      OverlapPolicy::Deny => f.write_str("Deny"),
      OverlapPolicy::Predicate(_) => f.write_str("Predicate(<Fn>)"),
    }
  }
}

/// Recurrence of a periodic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
  /// Interval between runs.
  pub run_every: StdDuration,
  /// Fixed point in time that run boundaries are aligned to.
  pub anchor: Option<DateTime<Utc>>,
}

/// A named unit of work. Registered once at startup and immutable afterwards.
///
/// ```
/// use taskwheel::job::{Job, JobArgs, OverlapPolicy};
/// use std::time::Duration;
///
/// let add = Job::regular("add", |args: JobArgs| async move {
///   let a: i64 = args.positional(0)?;
///   let b: i64 = args.positional(1)?;
///   Ok(serde_json::json!(a + b))
/// })
/// .with_overlap(OverlapPolicy::Deny)
/// .with_timeout(Duration::from_secs(30));
/// assert_eq!(add.name(), "add");
/// ```
pub struct Job {
  name: String,
  doc: Option<String>,
  overlap: OverlapPolicy,
  timeout: Option<StdDuration>,
  max_retries: u32,
  recurrence: Option<Recurrence>,
  exec_fn: BoxedJobFn,
}

impl Job {
  /// Creates a regular job, run only when submitted.
  pub fn regular<F, Fut>(name: &str, f: F) -> Self
  where
    F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    Self::from_boxed(name, Box::new(move |args| Box::pin(f(args))))
  }

  /// Creates a periodic job, submitted by the scheduler every `run_every`.
  pub fn periodic<F, Fut>(name: &str, run_every: StdDuration, f: F) -> Self
  where
    F: Fn(JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let mut job = Self::regular(name, f);
    job.recurrence = Some(Recurrence {
      run_every,
      anchor: None,
    });
    job
  }

  /// Creates a regular job from an already boxed function.
  pub fn from_boxed(name: &str, exec_fn: BoxedJobFn) -> Self {
    Self {
      name: name.to_string(),
      doc: None,
      overlap: OverlapPolicy::Allow,
      timeout: None,
      max_retries: 0,
      recurrence: None,
      exec_fn,
    }
  }

  pub fn with_doc(mut self, doc: &str) -> Self {
    self.doc = Some(doc.to_string());
    self
  }

  pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
    self.overlap = overlap;
    self
  }

  /// Time after submission at which a task of this job expires.
  pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// Aligns a periodic job's runs to `anchor`. Has no effect on regular jobs.
  pub fn with_anchor(mut self, anchor: DateTime<Utc>) -> Self {
    if let Some(recurrence) = self.recurrence.as_mut() {
      recurrence.anchor = Some(anchor);
    }
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn doc(&self) -> Option<&str> {
    self.doc.as_deref()
  }

  pub fn kind(&self) -> JobKind {
    if self.recurrence.is_some() {
      JobKind::Periodic
    } else {
      JobKind::Regular
    }
  }

  pub fn overlap(&self) -> &OverlapPolicy {
    &self.overlap
  }

  pub fn timeout(&self) -> Option<StdDuration> {
    self.timeout
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  pub fn recurrence(&self) -> Option<&Recurrence> {
    self.recurrence.as_ref()
  }

  /// Builds the future for one execution of the job body.
  pub fn call(&self, args: JobArgs) -> JobFuture {
    (self.exec_fn)(args)
  }
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("name", &self.name)
      .field("kind", &self.kind())
      .field("overlap", &self.overlap)
      .field("timeout", &self.timeout)
      .field("max_retries", &self.max_retries)
      .field("recurrence", &self.recurrence)
      .field("exec_fn", &format_args!("<Fn>"))
      .finish()
  }
}

/// Creates an anchor for today (UTC) at the given wall-clock time.
pub fn anchor_at(hour: u32, minute: u32, second: u32) -> Option<DateTime<Utc>> {
  Utc::now()
    .date_naive()
    .and_hms_opt(hour, minute, second)
    .map(|naive| naive.and_utc())
}

// --- Public Snapshot Struct for Querying ---

/// Description of a registered job, as returned by `TaskBackend::list_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
  pub name: String,
  pub kind: JobKind,
  pub doc: Option<String>,
  /// `yes`, `no` or `maybe`.
  pub can_overlap: String,
  pub timeout: Option<StdDuration>,
  pub max_retries: u32,
  /// Periodic jobs only, like the two fields below.
  pub run_every: Option<StdDuration>,
  /// Time until the next periodic run, zero when it is due.
  pub next_run_in: Option<StdDuration>,
  pub runs_count: Option<u64>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn args_accessors() {
    let args = JobArgs::new().arg(2).arg("x").kwarg("flag", true);
    assert_eq!(args.positional::<i64>(0).unwrap(), 2);
    assert_eq!(args.positional::<String>(1).unwrap(), "x");
    assert!(args.positional::<i64>(2).is_err());
    assert!(args.positional::<i64>(1).is_err());
    assert_eq!(args.keyword::<bool>("flag").unwrap(), Some(true));
    assert_eq!(args.keyword::<bool>("other").unwrap(), None);
  }

  #[test]
  fn canonical_form_is_order_independent() {
    let a = JobArgs::new().kwarg("b", json!({"z": 1, "a": 2})).kwarg("a", 1);
    let b = JobArgs::new().kwarg("a", 1).kwarg("b", json!({"a": 2, "z": 1}));
    assert_eq!(a.canonical(), b.canonical());
  }

  #[test]
  fn overlap_policies() {
    let args = JobArgs::new().kwarg("force", true);
    assert!(OverlapPolicy::Allow.can_overlap(&args));
    assert!(!OverlapPolicy::Deny.can_overlap(&args));
    let p = OverlapPolicy::predicate(|a| a.keyword::<bool>("force").ok().flatten() == Some(true));
    assert!(p.can_overlap(&args));
    assert!(!p.can_overlap(&JobArgs::new()));
    assert_eq!(p.describe(), "maybe");
  }

  #[tokio::test]
  async fn periodic_job_and_call() {
    let job = Job::periodic("tick", StdDuration::from_secs(10), |_args| async { Ok(json!("ok")) })
      .with_anchor(anchor_at(0, 25, 0).unwrap());
    assert_eq!(job.kind(), JobKind::Periodic);
    assert!(job.recurrence().unwrap().anchor.is_some());
    assert_eq!(job.call(JobArgs::new()).await.unwrap(), json!("ok"));

    let regular = Job::regular("plain", |_args| async { Ok(Value::Null) })
      .with_anchor(Utc::now());
    assert_eq!(regular.kind(), JobKind::Regular);
    assert!(regular.recurrence().is_none());
  }
}
