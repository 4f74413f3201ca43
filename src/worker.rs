use crate::backend::{BackendShared, TaskBackend};
use crate::command::ExecutionOutcome;
use crate::error::{ExecutionError, JobError};
use crate::job::{Job, JobFuture, JobResult};
use crate::metrics::BackendMetrics;
use crate::notify::LifecycleEvent;
use crate::task::{Task, TaskId, TaskResult, TaskStatus, TaskUpdate};

#[cfg(feature = "job_context")]
use crate::job::context::{TaskContext, CURRENT_TASK_CONTEXT};

use std::any::Any;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Executes job bodies off the poll loop.
///
/// The returned future resolves once the body finished, panicked, or was
/// cancelled by the pool. Dropping it must stop the body.
pub trait WorkerPool: Send + Sync + 'static {
  fn execute(&self, job: JobFuture) -> BoxFuture<'static, Result<JobResult, ExecutionError>>;
}

/// [`WorkerPool`] that spawns every body as its own Tokio task, either on the
/// current runtime or on a dedicated one.
#[derive(Debug, Clone, Default)]
pub struct TokioWorkerPool {
  runtime: Option<Handle>,
}

impl TokioWorkerPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Spawns bodies on `runtime`, e.g. a separate runtime reserved for job work.
  pub fn on_runtime(runtime: Handle) -> Self {
    Self {
      runtime: Some(runtime),
    }
  }
}

/// Aborts the spawned body when the execution future is dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
  fn drop(&mut self) {
    self.0.abort();
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(msg) = payload.downcast_ref::<&'static str>() {
    (*msg).to_string()
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

impl WorkerPool for TokioWorkerPool {
  fn execute(&self, job: JobFuture) -> BoxFuture<'static, Result<JobResult, ExecutionError>> {
    let handle = match &self.runtime {
      Some(runtime) => runtime.spawn(job),
      None => tokio::spawn(job),
    };
    let mut guard = AbortOnDrop(handle);
    async move {
      match (&mut guard.0).await {
        Ok(result) => Ok(result),
        Err(join_error) if join_error.is_panic() => Err(ExecutionError::Panicked(panic_message(
          join_error.into_panic(),
        ))),
        Err(_) => Err(ExecutionError::Cancelled),
      }
    }
    .boxed()
  }
}

// --- Execution ---

enum Classified {
  /// Put the task back in the queue.
  Retry(String),
  Final(TaskUpdate),
}

/// Runs a `STARTED` task to its outcome on a separate Tokio task.
pub(crate) fn spawn_execution(
  backend: TaskBackend,
  job: Arc<Job>,
  task: Task,
  cancel_rx: oneshot::Receiver<()>,
) {
  let span = tracing::info_span!(
    "task_exec",
    backend = %backend.id(),
    task_id = %task.id,
    job = %task.name
  );
  tokio::spawn(execute(backend, job, task, cancel_rx).instrument(span));
}

async fn expires(expiry: Option<DateTime<Utc>>) {
  match expiry {
    Some(at) => {
      let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
      tokio::time::sleep(wait).await
    }
    None => std::future::pending::<()>().await,
  }
}

async fn execute(
  backend: TaskBackend,
  job: Arc<Job>,
  task: Task,
  cancel_rx: oneshot::Receiver<()>,
) {
  let shared = backend.shared.clone();
  let started_at = Instant::now();
  info!("starting {}", task.info());

  let body = job.call(task.args.clone());
  #[cfg(feature = "job_context")]
  let body: JobFuture = {
    let context = TaskContext::new(task.id, &task.name, task.retries, backend.clone());
    Box::pin(CURRENT_TASK_CONTEXT.scope(context, body))
  };

  // The expiry timer supervises the body; dropping `run` stops it.
  let run = shared.pool.execute(body);
  let result = tokio::select! {
    result = run => result,
    _ = expires(task.expiry) => Err(ExecutionError::TaskTimeout),
    Ok(()) = cancel_rx => Err(ExecutionError::Revoked),
  };

  let duration = started_at.elapsed();
  shared.metrics.task_execution_duration.record(duration);
  if let Err(ExecutionError::Panicked(msg)) = &result {
    error!(panic = %msg, "Job body panicked in {}", task.info());
    BackendMetrics::incr(&shared.metrics.tasks_panicked);
  }

  let (status, finished) = match classify(&job, &task, result) {
    Classified::Retry(reason) => (retry(&shared, &task, reason).await, None),
    Classified::Final(update) => {
      let status = update.status.unwrap_or(TaskStatus::Failure);
      let update = update.with_time_ended(Utc::now());
      (status, finish_task(&shared, task.id, update).await)
    }
  };

  release_in_flight(&shared, task.id);
  if let Some(finished) = finished {
    announce_done(&shared, &finished).await;
  }

  info!(
    duration_ms = duration.as_millis() as u64,
    %status,
    "Finished execution of {}", task.info()
  );
  let outcome = ExecutionOutcome {
    task_id: task.id,
    status,
    duration,
  };
  if shared.outcome_tx.send(outcome).is_err() {
    debug!("Poll loop gone, execution outcome dropped.");
  }
}

fn classify(job: &Job, task: &Task, result: Result<JobResult, ExecutionError>) -> Classified {
  let failure = |message: String| {
    Classified::Final(
      TaskUpdate::new()
        .with_status(TaskStatus::Failure)
        .with_result(TaskResult::Error(message)),
    )
  };
  match result {
    Ok(Ok(value)) => Classified::Final(
      TaskUpdate::new()
        .with_status(TaskStatus::Success)
        .with_result(TaskResult::Value(value)),
    ),
    Ok(Err(JobError::Retry(reason))) if task.retries < job.max_retries() => {
      Classified::Retry(reason)
    }
    Ok(Err(err)) => {
      warn!(error = %err, "failure in {}", task.info());
      failure(err.to_string())
    }
    Err(ExecutionError::TaskTimeout) => {
      info!("{} timed-out", task.info());
      Classified::Final(TaskUpdate::new().with_status(TaskStatus::Revoked))
    }
    Err(err @ (ExecutionError::Revoked | ExecutionError::Cancelled)) => {
      info!(reason = %err, "{} revoked", task.info());
      Classified::Final(TaskUpdate::new().with_status(TaskStatus::Revoked))
    }
    Err(err @ ExecutionError::Panicked(_)) => failure(err.to_string()),
  }
}

async fn retry(shared: &BackendShared, task: &Task, reason: String) -> TaskStatus {
  let retries = task.retries + 1;
  let update = TaskUpdate::new()
    .with_status(TaskStatus::Retry)
    .with_retries(retries)
    .with_result(TaskResult::Error(reason));
  let moved = shared
    .store_persist("retry", || {
      shared
        .store
        .update_if(task.id, &[TaskStatus::Started], update.clone())
    })
    .await;
  match moved {
    Ok(Some(_)) => {
      BackendMetrics::incr(&shared.metrics.tasks_retried);
      info!(retries, "{} failed, re-queueing", task.info());
      if let Err(e) = shared.store_persist("enqueue", || shared.store.enqueue(task.id)).await {
        error!(error = %e, "Failed to re-queue {}", task.info());
      }
      TaskStatus::Retry
    }
    Ok(None) => {
      debug!("{} was finalized elsewhere, not retrying", task.info());
      TaskStatus::Revoked
    }
    Err(e) => {
      error!(error = %e, "Failed to record retry of {}", task.info());
      TaskStatus::Started
    }
  }
}

fn release_in_flight(shared: &BackendShared, task_id: TaskId) {
  let mut in_flight = shared.in_flight.lock();
  in_flight.remove(&task_id);
  shared
    .metrics
    .tasks_in_flight
    .store(in_flight.len(), AtomicOrdering::Relaxed);
}

// --- Finalization ---

/// Persists a terminal update, waiting out store outages. `None` if the task
/// was already terminal or the write was abandoned, in which case no "done"
/// event must follow.
pub(crate) async fn finish_task(
  shared: &BackendShared,
  task_id: TaskId,
  update: TaskUpdate,
) -> Option<Task> {
  let finished = shared
    .store_persist("finish", || shared.store.finish(task_id, update.clone()))
    .await;
  match finished {
    Ok(Some(task)) => Some(task),
    Ok(None) => {
      debug!(%task_id, "Task already finalized, skipping.");
      None
    }
    Err(e) => {
      error!(%task_id, error = %e, "Failed to persist task outcome.");
      None
    }
  }
}

/// Publishes "done" for a freshly finalized task and releases its local waiters.
pub(crate) async fn announce_done(shared: &BackendShared, task: &Task) {
  shared.metrics.record_finished(task.status);
  info!("finished {}", task);
  shared.publish(LifecycleEvent::Done, task.id).await;
  shared.waiters.release(task);
}
