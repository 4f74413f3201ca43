use crate::command::{ExecutionOutcome, ShutdownMode};
use crate::config::BackendConfig;
use crate::coordinator::{self, Coordinator};
use crate::error::{
  BuildError, NotifyError, QueryError, ShutdownError, StoreError, SubmitError, WaitError,
};
use crate::job::{JobArgs, JobInfo, JobKind};
use crate::metrics::{BackendMetrics, MetricsSnapshot};
use crate::notify::{LifecycleEvent, LocalNotifier, Notifier, TaskIdStream};
use crate::registry::JobRegistry;
use crate::scheduler::PeriodicScheduler;
use crate::store::{InMemoryTaskStore, TaskStore};
use crate::task::{self, Task, TaskFilter, TaskId, TaskMeta, TaskStatus, TaskUpdate};
use crate::waiters::Waiters;
use crate::worker::{self, TokioWorkerPool, WorkerPool};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of [`TaskBackend::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
  /// A new task was created and queued.
  Created(TaskId),
  /// An equivalent task is still live; this is its id. No task was created.
  Suppressed(TaskId),
}

impl Submission {
  pub fn task_id(&self) -> TaskId {
    match self {
      Submission::Created(id) | Submission::Suppressed(id) => *id,
    }
  }

  pub fn is_suppressed(&self) -> bool {
    matches!(self, Submission::Suppressed(_))
  }
}

/// Builder for configuring and creating a [`TaskBackend`].
///
/// Store, notifier and worker pool default to the in-process implementations.
pub struct TaskBackendBuilder {
  registry: Arc<JobRegistry>,
  config: BackendConfig,
  store: Option<Arc<dyn TaskStore>>,
  notifier: Option<Arc<dyn Notifier>>,
  worker_pool: Option<Arc<dyn WorkerPool>>,
}

impl TaskBackendBuilder {
  pub fn new(registry: Arc<JobRegistry>) -> Self {
    Self {
      registry,
      config: BackendConfig::default(),
      store: None,
      notifier: None,
      worker_pool: None,
    }
  }

  /// Replaces the whole configuration.
  pub fn config(mut self, config: BackendConfig) -> Self {
    self.config = config;
    self
  }

  pub fn name(mut self, name: &str) -> Self {
    self.config.name = name.to_string();
    self
  }

  /// Sets the maximum number of concurrently running tasks. Must be > 0.
  pub fn backlog(mut self, backlog: usize) -> Self {
    self.config.backlog = backlog;
    self
  }

  /// Requests a restart after this many tasks. `0` means no limit.
  pub fn max_tasks(mut self, max_tasks: u64) -> Self {
    self.config.max_tasks = max_tasks;
    self
  }

  pub fn poll_timeout(mut self, timeout: Duration) -> Self {
    self.config.poll_timeout = timeout;
    self
  }

  pub fn backpressure_delay(mut self, delay: Duration) -> Self {
    self.config.backpressure_delay = delay;
    self
  }

  pub fn error_retry_delay(mut self, delay: Duration) -> Self {
    self.config.error_retry_delay = delay;
    self
  }

  /// Runs the periodic ticker once the backend is started.
  pub fn schedule_periodic(mut self, enabled: bool) -> Self {
    self.config.schedule_periodic = enabled;
    self
  }

  pub fn store_retry_attempts(mut self, attempts: u32) -> Self {
    self.config.store_retry_attempts = attempts;
    self
  }

  pub fn max_tick_interval(mut self, interval: Duration) -> Self {
    self.config.max_tick_interval = interval;
    self
  }

  pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  pub fn worker_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
    self.worker_pool = Some(pool);
    self
  }

  /// Validates the configuration and creates the backend. No loop runs until
  /// [`TaskBackend::start`] is called.
  pub fn build(self) -> Result<TaskBackend, BuildError> {
    self.config.validate()?;
    for job in self.registry.list(Some(JobKind::Periodic)) {
      if job.recurrence().map_or(true, |r| r.run_every.is_zero()) {
        return Err(BuildError::InvalidPeriodicJob(job.name().to_string()));
      }
    }

    let id = format!(
      "{}-{}",
      self.config.name,
      &Uuid::new_v4().simple().to_string()[..8]
    );
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = watch::channel(None);
    let (restart_tx, _) = watch::channel(false);
    let scheduler = PeriodicScheduler::from_registry(&self.registry);

    info!(
      backend = %id,
      backlog = self.config.backlog,
      periodic_jobs = scheduler.entries().count(),
      "Building task backend."
    );

    let shared = BackendShared {
      id,
      config: self.config,
      registry: self.registry,
      store: self
        .store
        .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
      notifier: self
        .notifier
        .unwrap_or_else(|| Arc::new(LocalNotifier::new())),
      pool: self
        .worker_pool
        .unwrap_or_else(|| Arc::new(TokioWorkerPool::new())),
      waiters: Waiters::new(),
      scheduler: Mutex::new(scheduler),
      in_flight: Mutex::new(HashMap::new()),
      processed: AtomicU64::new(0),
      metrics: BackendMetrics::new(),
      outcome_tx,
      outcome_rx: Mutex::new(Some(outcome_rx)),
      shutdown_tx,
      restart_tx,
      handles: Mutex::new(Vec::new()),
      started: AtomicBool::new(false),
    };
    Ok(TaskBackend {
      shared: Arc::new(shared),
    })
  }
}

/// State shared by the handle, the backend loops and running executions.
pub(crate) struct BackendShared {
  pub(crate) id: String,
  pub(crate) config: BackendConfig,
  pub(crate) registry: Arc<JobRegistry>,
  pub(crate) store: Arc<dyn TaskStore>,
  pub(crate) notifier: Arc<dyn Notifier>,
  pub(crate) pool: Arc<dyn WorkerPool>,
  pub(crate) waiters: Waiters,
  pub(crate) scheduler: Mutex<PeriodicScheduler>,
  /// Tasks started by this backend -> cancellation signal of their execution.
  pub(crate) in_flight: Mutex<HashMap<TaskId, Option<oneshot::Sender<()>>>>,
  pub(crate) processed: AtomicU64,
  pub(crate) metrics: BackendMetrics,
  pub(crate) outcome_tx: mpsc::UnboundedSender<ExecutionOutcome>,
  outcome_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutionOutcome>>>,
  pub(crate) shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  pub(crate) restart_tx: watch::Sender<bool>,
  handles: Mutex<Vec<JoinHandle<()>>>,
  started: AtomicBool,
}

impl BackendShared {
  pub(crate) async fn publish(&self, event: LifecycleEvent, task_id: TaskId) {
    let channel = event.channel(&self.config.name);
    if let Err(e) = self.notifier.publish(&channel, task_id).await {
      warn!(%channel, %task_id, error = %e, "Failed to publish lifecycle event.");
    }
  }

  /// Runs a store operation, retrying it while the store reports itself unavailable.
  pub(crate) async fn store_retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, StoreError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
  {
    let attempts = self.config.store_retry_attempts.max(1);
    let mut attempt = 1;
    loop {
      match f().await {
        Err(StoreError::Unavailable(reason)) if attempt < attempts => {
          warn!(op, attempt, %reason, "Task store unavailable, retrying.");
          attempt += 1;
          tokio::time::sleep(self.config.error_retry_delay).await;
        }
        other => return other,
      }
    }
  }

  /// Like [`store_retry`](Self::store_retry), but keeps going while the store
  /// stays unavailable. Gives up only once a forced shutdown was requested.
  pub(crate) async fn store_persist<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, StoreError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
  {
    loop {
      match self.store_retry(op, &mut f).await {
        Err(StoreError::Unavailable(reason))
          if self.shutdown_mode() != Some(ShutdownMode::Force) =>
        {
          error!(op, %reason, "Task store still unavailable, holding the write.");
          tokio::time::sleep(self.config.error_retry_delay).await;
        }
        other => return other,
      }
    }
  }

  pub(crate) fn shutdown_mode(&self) -> Option<ShutdownMode> {
    *self.shutdown_tx.borrow()
  }
}

/// Handle to a task backend: submission, queries, waiting and lifecycle.
///
/// Cheap to clone; every clone drives the same backend.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use taskwheel::{Job, JobArgs, JobRegistry, TaskBackend, TaskMeta};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = JobRegistry::new();
/// registry.register(Job::regular("add", |args: JobArgs| async move {
///   let a: i64 = args.positional(0)?;
///   let b: i64 = args.positional(1)?;
///   Ok(serde_json::json!(a + b))
/// }))?;
///
/// let backend = TaskBackend::builder(Arc::new(registry)).backlog(4).build()?;
/// backend.start();
///
/// let submission = backend
///   .submit("add", JobArgs::new().arg(2).arg(3), TaskMeta::new())
///   .await?;
/// let task = backend
///   .wait_for_task(submission.task_id(), Some(Duration::from_secs(5)))
///   .await?;
/// println!("{}", task);
///
/// backend.shutdown_graceful(Some(Duration::from_secs(10))).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskBackend {
  pub(crate) shared: Arc<BackendShared>,
}

impl TaskBackend {
  pub fn builder(registry: Arc<JobRegistry>) -> TaskBackendBuilder {
    TaskBackendBuilder::new(registry)
  }

  /// Unique id of this backend, recorded on the tasks it starts.
  pub fn id(&self) -> &str {
    &self.shared.id
  }

  pub fn config(&self) -> &BackendConfig {
    &self.shared.config
  }

  pub fn registry(&self) -> &Arc<JobRegistry> {
    &self.shared.registry
  }

  pub fn store(&self) -> &Arc<dyn TaskStore> {
    &self.shared.store
  }

  /// Spawns the poll loop, the done listener and, with `schedule_periodic`, the
  /// periodic ticker. Must be called within a Tokio runtime. Calling it again
  /// has no effect.
  pub fn start(&self) {
    let shared = &self.shared;
    if shared.started.swap(true, AtomicOrdering::SeqCst) {
      warn!(backend = %shared.id, "Backend already started.");
      return;
    }

    let mut handles = shared.handles.lock();
    if let Some(outcome_rx) = shared.outcome_rx.lock().take() {
      let coordinator = Coordinator::new(self.clone(), outcome_rx, shared.shutdown_tx.subscribe());
      handles.push(tokio::spawn(coordinator.run()));
    }
    handles.push(tokio::spawn(coordinator::run_done_listener(
      self.clone(),
      shared.shutdown_tx.subscribe(),
    )));
    let has_periodic = !shared.scheduler.lock().is_empty();
    if shared.config.schedule_periodic && has_periodic {
      handles.push(tokio::spawn(coordinator::run_ticker(
        self.clone(),
        shared.shutdown_tx.subscribe(),
      )));
    }
    info!(backend = %shared.id, loops = handles.len(), "Task backend started.");
  }

  // --- Submission ---

  /// Creates a task for `job_name`, unless the job restricts overlap and an
  /// equivalent task is still live, in which case that task's id is returned.
  ///
  /// The job body is not run here; the task is queued for a poll loop to pick up.
  pub async fn submit(
    &self,
    job_name: &str,
    args: JobArgs,
    meta: TaskMeta,
  ) -> Result<Submission, SubmitError> {
    let shared = &self.shared;
    if shared.shutdown_mode().is_some() {
      return Err(SubmitError::ShuttingDown);
    }
    let job = shared
      .registry
      .lookup(job_name)
      .ok_or_else(|| SubmitError::JobNotFound(job_name.to_string()))?;

    let overlap_id = (!job.overlap().can_overlap(&args)).then(|| task::overlap_id(job_name, &args));
    if let Some(key) = &overlap_id {
      let holders = shared
        .store
        .list(&TaskFilter::new().with_overlap_id(key))
        .await?;
      for holder in holders {
        if !holder.is_done() {
          return Ok(self.suppressed(job_name, holder.id));
        }
        // Finished holder: free the key.
        shared
          .store
          .update(holder.id, TaskUpdate::new().clearing_overlap())
          .await?;
      }
    }

    let now = Utc::now();
    let expiry = meta.expiry.or_else(|| {
      job
        .timeout()
        .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
        .and_then(|timeout| now.checked_add_signed(timeout))
    });
    let task = Task::new(job_name, args, overlap_id, now, expiry, meta);
    let task_id = task.id;

    let created = shared
      .store_retry("create", || shared.store.create(task.clone()))
      .await;
    match created {
      Ok(_) => {}
      Err(StoreError::OverlapTaken { holder, .. }) => {
        return Ok(self.suppressed(job_name, holder));
      }
      Err(e) => return Err(e.into()),
    }
    BackendMetrics::incr(&shared.metrics.tasks_submitted);
    shared.publish(LifecycleEvent::Created, task_id).await;

    shared
      .store_retry("enqueue", || shared.store.enqueue(task_id))
      .await?;
    debug!(%task_id, "queued {}", task.info());
    Ok(Submission::Created(task_id))
  }

  fn suppressed(&self, job_name: &str, holder: TaskId) -> Submission {
    BackendMetrics::incr(&self.shared.metrics.tasks_suppressed);
    info!(job = job_name, task_id = %holder, "Submission suppressed, equivalent task still live.");
    Submission::Suppressed(holder)
  }

  // --- Queries ---

  pub async fn get_task(&self, task_id: TaskId) -> Result<Task, QueryError> {
    self
      .shared
      .store
      .get(task_id)
      .await?
      .ok_or(QueryError::TaskNotFound(task_id))
  }

  pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueryError> {
    Ok(self.shared.store.list(filter).await?)
  }

  /// Waits until `task_id` reaches a terminal status.
  ///
  /// A timeout only stops this wait; the task itself keeps running.
  pub async fn wait_for_task(
    &self,
    task_id: TaskId,
    timeout: Option<Duration>,
  ) -> Result<Task, WaitError> {
    let shared = &self.shared;
    // Register before re-reading so a completion in between is not missed.
    let completion = shared.waiters.register(task_id);
    let task = match shared.store.get(task_id).await {
      Ok(Some(task)) => task,
      Ok(None) => {
        shared.waiters.forget(task_id);
        return Err(WaitError::TaskNotFound(task_id));
      }
      Err(e) => {
        drop(completion);
        shared.waiters.forget_unshared(task_id);
        return Err(e.into());
      }
    };
    if task.is_done() {
      shared.waiters.release(&task);
      return Ok(task);
    }

    let finished = match timeout {
      Some(limit) => {
        let waited = tokio::time::timeout(limit, completion).await;
        match waited {
          Ok(finished) => finished,
          Err(_) => {
            shared.waiters.forget_unshared(task_id);
            return Err(WaitError::Timeout {
              task_id,
              timeout: limit,
            });
          }
        }
      }
      None => completion.await,
    };
    finished.map_err(|_| WaitError::Abandoned(task_id))
  }

  /// Registered jobs with their overlap policy and schedule.
  pub fn list_jobs(&self) -> Vec<JobInfo> {
    let now = Utc::now();
    let scheduler = self.shared.scheduler.lock();
    self
      .shared
      .registry
      .list(None)
      .iter()
      .map(|job| {
        let entry = scheduler.entry(job.name());
        JobInfo {
          name: job.name().to_string(),
          kind: job.kind(),
          doc: job.doc().map(str::to_string),
          can_overlap: job.overlap().describe().to_string(),
          timeout: job.timeout(),
          max_retries: job.max_retries(),
          run_every: job.recurrence().map(|r| r.run_every),
          next_run_in: entry.map(|e| {
            let status = e.is_due(now);
            if status.due {
              Duration::ZERO
            } else {
              status.next_in
            }
          }),
          runs_count: entry.map(|e| e.total_run_count),
        }
      })
      .collect()
  }

  /// The periodic job among `names` (all when `None`) that runs next, and the
  /// time until it does.
  pub fn next_scheduled(&self, names: Option<&[&str]>) -> Option<(String, Duration)> {
    self
      .shared
      .scheduler
      .lock()
      .next_scheduled(names, Utc::now())
  }

  /// Submits a task for every periodic job due at `now` and returns the time
  /// until the next one is due. The ticker calls this; tests may call it with a
  /// synthetic clock.
  pub async fn tick(&self, now: DateTime<Utc>) -> Option<Duration> {
    let (due, next) = self.shared.scheduler.lock().fire_due(now);
    for name in due {
      BackendMetrics::incr(&self.shared.metrics.periodic_fired);
      match self.submit(&name, JobArgs::new(), TaskMeta::new()).await {
        Ok(submission) => {
          debug!(job = %name, task_id = %submission.task_id(), "Periodic job fired.")
        }
        Err(e) => error!(job = %name, error = %e, "Failed to submit periodic job."),
      }
    }
    next
  }

  /// Finalizes a live task as `REVOKED`, cancelling its execution if it runs
  /// on this backend. A terminal task is returned unchanged.
  pub async fn revoke(&self, task_id: TaskId) -> Result<Task, QueryError> {
    let shared = &self.shared;
    let task = self.get_task(task_id).await?;
    if task.is_done() {
      return Ok(task);
    }
    let update = TaskUpdate::new()
      .with_status(TaskStatus::Revoked)
      .with_time_ended(Utc::now());
    let finished = worker::finish_task(shared, task_id, update).await;

    let cancel = shared
      .in_flight
      .lock()
      .get_mut(&task_id)
      .and_then(Option::take);
    if let Some(cancel) = cancel {
      let _ = cancel.send(());
    }

    match finished {
      Some(task) => {
        info!("revoked {}", task.info());
        worker::announce_done(shared, &task).await;
        Ok(task)
      }
      None => self.get_task(task_id).await,
    }
  }

  /// Stream of task ids published for `event` on this backend's channels.
  pub async fn subscribe(&self, event: LifecycleEvent) -> Result<TaskIdStream, NotifyError> {
    let channel = event.channel(&self.shared.config.name);
    self.shared.notifier.subscribe(&channel).await
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  /// Tasks started by this backend so far.
  pub fn processed(&self) -> u64 {
    self.shared.processed.load(AtomicOrdering::Relaxed)
  }

  /// Tasks currently running on this backend.
  pub fn in_flight(&self) -> usize {
    self.shared.in_flight.lock().len()
  }

  /// Removes every task from the store.
  pub async fn flush(&self) -> Result<(), StoreError> {
    self.shared.store.flush().await
  }

  // --- Restart & Shutdown ---

  /// `true` once `max_tasks` was reached and the poll loop stopped.
  pub fn restart_requested(&self) -> bool {
    *self.shared.restart_tx.borrow()
  }

  /// Resolves once the poll loop requested a restart.
  pub async fn wait_for_restart(&self) {
    let mut rx = self.shared.restart_tx.subscribe();
    let _ = rx.wait_for(|requested| *requested).await;
  }

  /// Stops polling and waits for in-flight tasks to finish.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!(backend = %self.id(), "Initiating graceful shutdown...");
    self.signal_shutdown(ShutdownMode::Graceful)?;
    self.await_shutdown(timeout).await
  }

  /// Stops polling and revokes in-flight tasks.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!(backend = %self.id(), "Initiating forced shutdown...");
    self.signal_shutdown(ShutdownMode::Force)?;
    let cancels: Vec<_> = self
      .shared
      .in_flight
      .lock()
      .values_mut()
      .filter_map(Option::take)
      .collect();
    for cancel in cancels {
      let _ = cancel.send(());
    }
    self.await_shutdown(timeout).await
  }

  fn signal_shutdown(&self, mode: ShutdownMode) -> Result<(), ShutdownError> {
    let previous = self.shared.shutdown_tx.send_replace(Some(mode));
    if previous == Some(mode) {
      return Err(ShutdownError::SignalFailed);
    }
    Ok(())
  }

  async fn await_shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let handles = std::mem::take(&mut *self.shared.handles.lock());
    if handles.is_empty() {
      debug!("No backend loops to await.");
      return Ok(());
    }

    let join_all = try_join_all(handles);
    let joined = match timeout {
      Some(limit) => match tokio::time::timeout(limit, join_all).await {
        Ok(joined) => joined,
        Err(_) => {
          error!("Shutdown timed out after {:?}", limit);
          return Err(ShutdownError::Timeout);
        }
      },
      None => join_all.await,
    };

    match joined {
      Ok(_) => {
        info!(backend = %self.id(), "All backend loops joined.");
        Ok(())
      }
      Err(join_err) => {
        error!("A backend loop panicked during shutdown: {:?}", join_err);
        Err(ShutdownError::TaskPanic)
      }
    }
  }
}

impl fmt::Debug for TaskBackend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskBackend")
      .field("id", &self.shared.id)
      .field("config", &self.shared.config)
      .field("jobs", &self.shared.registry.len())
      .field("in_flight", &self.in_flight())
      .field("waiters", &self.shared.waiters.len())
      .finish()
  }
}
