//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use taskwheel::error::StoreError;
use taskwheel::{
  InMemoryTaskStore, Job, JobArgs, JobError, JobRegistry, Task, TaskBackend, TaskFilter, TaskId,
  TaskStatus, TaskStore, TaskUpdate,
};
use tracing_subscriber::EnvFilter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskwheel=debug")),
    )
    .with_test_writer()
    .try_init();
}

// Builds an unstarted backend with delays short enough for tests.
pub fn build_backend(
  registry: JobRegistry,
  backlog: usize,
) -> Result<TaskBackend, taskwheel::error::BuildError> {
  TaskBackend::builder(Arc::new(registry))
    .name("test")
    .backlog(backlog)
    .poll_timeout(StdDuration::from_millis(50))
    .backpressure_delay(StdDuration::from_millis(20))
    .error_retry_delay(StdDuration::from_millis(20))
    .build()
}

// Same as `build_backend`, on top of the given store.
pub fn build_backend_on(
  registry: JobRegistry,
  backlog: usize,
  store: Arc<dyn TaskStore>,
) -> TaskBackend {
  TaskBackend::builder(Arc::new(registry))
    .name("test")
    .backlog(backlog)
    .store(store)
    .poll_timeout(StdDuration::from_millis(50))
    .backpressure_delay(StdDuration::from_millis(20))
    .error_retry_delay(StdDuration::from_millis(20))
    .build()
    .expect("Failed to build backend")
}

// Builds and starts a backend.
pub fn start_backend(registry: JobRegistry, backlog: usize) -> TaskBackend {
  let backend = build_backend(registry, backlog).expect("Failed to build backend");
  backend.start();
  backend
}

// `add(a, b)`: sums two positional integers.
pub fn add_job() -> Job {
  Job::regular("add", |args: JobArgs| async move {
    let a: i64 = args.positional(0)?;
    let b: i64 = args.positional(1)?;
    Ok(json!(a + b))
  })
}

// Sleeps for `delay`, then returns `null`.
pub fn sleep_job(name: &str, delay: StdDuration) -> Job {
  Job::regular(name, move |_args| async move {
    tokio::time::sleep(delay).await;
    Ok(Value::Null)
  })
}

// Counts its executions.
pub fn counter_job(name: &str, counter: Arc<AtomicUsize>) -> Job {
  Job::regular(name, move |_args| {
    let ctr = counter.clone();
    async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(count, "Counter job executing");
      Ok(json!(count))
    }
  })
}

// Tracks concurrent executions. Increments active count on start, decrements
// on end, and updates the max observed.
pub fn concurrency_tracker_job(
  name: &str,
  active_counter: Arc<AtomicUsize>,
  max_observed_active: Arc<AtomicUsize>,
  delay: StdDuration,
) -> Job {
  Job::regular(name, move |_args| {
    let active = active_counter.clone();
    let max_obs = max_observed_active.clone();
    async move {
      let current_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Concurrency job START (Active: {})", current_active);
      max_obs.fetch_max(current_active, Ordering::SeqCst);

      tokio::time::sleep(delay).await;

      let current_active_after = active.fetch_sub(1, Ordering::SeqCst) - 1;
      tracing::debug!("Concurrency job END (Active: {})", current_active_after);
      Ok::<_, JobError>(Value::Null)
    }
  })
}

// Panics after yielding once.
pub fn panic_job(name: &str) -> Job {
  Job::regular(name, |_args| async {
    tokio::task::yield_now().await;
    if true {
      panic!("Job forced panic!");
    }
    Ok(Value::Null)
  })
}

// In-memory store whose operations can be made to fail with
// `StoreError::Unavailable` a given number of times.
#[derive(Default)]
pub struct FlakyStore {
  inner: InMemoryTaskStore,
  failures: Mutex<HashMap<&'static str, usize>>,
  failed: AtomicUsize,
}

impl FlakyStore {
  pub fn new() -> Self {
    Self::default()
  }

  // The next `times` calls of `op` fail.
  pub fn fail(&self, op: &'static str, times: usize) {
    self.failures.lock().insert(op, times);
  }

  // Number of calls that failed so far.
  pub fn failed(&self) -> usize {
    self.failed.load(Ordering::SeqCst)
  }

  fn check(&self, op: &'static str) -> Result<(), StoreError> {
    let mut failures = self.failures.lock();
    match failures.get_mut(op) {
      Some(left) if *left > 0 => {
        *left -= 1;
        self.failed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(op, "Injected store failure");
        Err(StoreError::Unavailable(format!("{} blip", op)))
      }
      _ => Ok(()),
    }
  }
}

#[async_trait]
impl TaskStore for FlakyStore {
  async fn create(&self, task: Task) -> Result<Task, StoreError> {
    self.check("create")?;
    self.inner.create(task).await
  }

  async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
    self.check("get")?;
    self.inner.get(id).await
  }

  async fn get_next_ready(&self, timeout: StdDuration) -> Result<Option<Task>, StoreError> {
    self.check("get_next_ready")?;
    self.inner.get_next_ready(timeout).await
  }

  async fn enqueue(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
    self.check("enqueue")?;
    self.inner.enqueue(id).await
  }

  async fn requeue(&self, id: TaskId) -> Result<bool, StoreError> {
    self.check("requeue")?;
    self.inner.requeue(id).await
  }

  async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
    self.check("list")?;
    self.inner.list(filter).await
  }

  async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, StoreError> {
    self.check("update")?;
    self.inner.update(id, update).await
  }

  async fn update_if(
    &self,
    id: TaskId,
    allowed: &[TaskStatus],
    update: TaskUpdate,
  ) -> Result<Option<Task>, StoreError> {
    self.check("update_if")?;
    self.inner.update_if(id, allowed, update).await
  }

  async fn finish(&self, id: TaskId, update: TaskUpdate) -> Result<Option<Task>, StoreError> {
    self.check("finish")?;
    self.inner.finish(id, update).await
  }

  async fn delete(&self, ids: &[TaskId]) -> Result<Vec<TaskId>, StoreError> {
    self.check("delete")?;
    self.inner.delete(ids).await
  }

  async fn count_pending(&self) -> Result<usize, StoreError> {
    self.check("count_pending")?;
    self.inner.count_pending().await
  }

  async fn flush(&self) -> Result<(), StoreError> {
    self.check("flush")?;
    self.inner.flush().await
  }
}
