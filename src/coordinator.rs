use crate::backend::{BackendShared, TaskBackend};
use crate::command::{ExecutionOutcome, ShutdownMode};
use crate::metrics::BackendMetrics;
use crate::notify::LifecycleEvent;
use crate::store;
use crate::task::{Task, TaskResult, TaskStatus, TaskUpdate};
use crate::worker;

use std::collections::VecDeque;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// What the poll loop does after one poll step.
enum PollStep {
  /// Poll again right away.
  Continue,
  /// Sleep, unless an execution finishes or shutdown is requested first.
  Wait(Duration),
  /// `max_tasks` reached with nothing in flight.
  Restart,
}

/// The backend's poll/dispatch loop.
///
/// Pulls queued tasks from the store while fewer than `backlog` tasks are in
/// flight, marks them `STARTED` in the order they were received, and hands
/// them to the worker pool without waiting for them.
pub(crate) struct Coordinator {
  backend: TaskBackend,
  /// Taken from the store but not yet marked `STARTED`; dispatched before polling again.
  held: VecDeque<Task>,
  outcome_rx: mpsc::UnboundedReceiver<ExecutionOutcome>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
}

impl Coordinator {
  pub fn new(
    backend: TaskBackend,
    outcome_rx: mpsc::UnboundedReceiver<ExecutionOutcome>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) -> Self {
    Self {
      backend,
      held: VecDeque::new(),
      outcome_rx,
      shutdown_rx,
    }
  }

  fn shutdown_mode(&self) -> Option<ShutdownMode> {
    *self.shutdown_rx.borrow()
  }

  pub async fn run(mut self) {
    info!(
      backend = %self.backend.id(),
      backlog = self.backend.shared.config.backlog,
      "Task poll loop started."
    );

    loop {
      while let Ok(outcome) = self.outcome_rx.try_recv() {
        record(&self.backend.shared, outcome);
      }
      if self.shutdown_mode().is_some() {
        break;
      }

      match self.poll_once().await {
        PollStep::Continue => {}
        PollStep::Wait(delay) => self.idle(delay).await,
        PollStep::Restart => {
          let shared = &self.backend.shared;
          warn!(
            processed = shared.processed.load(AtomicOrdering::Relaxed),
            "Processed task limit reached. Requesting restart."
          );
          shared.restart_tx.send_replace(true);
          break;
        }
      }
    }

    self.release_held().await;
    self.drain_in_flight().await;
    info!(backend = %self.backend.id(), "Task poll loop stopped.");
  }

  async fn poll_once(&mut self) -> PollStep {
    let shared = self.backend.shared.clone();
    let config = &shared.config;

    let in_flight = shared.in_flight.lock().len();
    if in_flight >= config.backlog {
      BackendMetrics::incr(&shared.metrics.backlog_skips);
      debug!(in_flight, "Backlog full, cannot poll.");
      return PollStep::Wait(config.backpressure_delay);
    }

    if config.max_tasks > 0 && shared.processed.load(AtomicOrdering::Relaxed) >= config.max_tasks {
      if in_flight == 0 {
        return PollStep::Restart;
      }
      return PollStep::Wait(config.backpressure_delay);
    }

    if let Some(task) = self.held.pop_front() {
      return self.dispatch(task).await;
    }

    let polled = tokio::select! {
      biased;
      _ = self.shutdown_rx.changed() => return PollStep::Continue,
      polled = shared.store.get_next_ready(config.poll_timeout) => polled,
    };

    match polled {
      Ok(Some(task)) => self.dispatch(task).await,
      Ok(None) => {
        trace!("No queued task.");
        PollStep::Continue
      }
      Err(e) => {
        BackendMetrics::incr(&shared.metrics.poll_errors);
        error!(error = %e, "Failed to poll task store, retrying.");
        PollStep::Wait(config.error_retry_delay)
      }
    }
  }

  async fn dispatch(&mut self, task: Task) -> PollStep {
    let shared = self.backend.shared.clone();
    let now = Utc::now();

    let Some(job) = shared.registry.lookup(&task.name) else {
      error!("{} not in registry", task.info());
      let update = TaskUpdate::new()
        .with_status(TaskStatus::Failure)
        .with_time_ended(now)
        .with_result(TaskResult::Error(format!("{} not in registry", task.info())));
      finalize_unstarted(&shared, &task, update).await;
      return PollStep::Continue;
    };

    if !task.status.can_start() {
      error!(status = %task.status, "invalid status for {}", task.info());
      return PollStep::Continue;
    }

    if task.is_expired(now) {
      info!("{} timed-out before starting", task.info());
      let update = TaskUpdate::new()
        .with_status(TaskStatus::Revoked)
        .with_time_ended(now);
      finalize_unstarted(&shared, &task, update).await;
      return PollStep::Continue;
    }

    let started = shared
      .store_retry("start", || {
        store::start_task(shared.store.as_ref(), task.id, &shared.id, now)
      })
      .await;
    let started = match started {
      Ok(Some(started)) => started,
      Ok(None) => {
        debug!("{} is no longer startable, skipping", task.info());
        return PollStep::Continue;
      }
      Err(e) => {
        BackendMetrics::incr(&shared.metrics.poll_errors);
        error!(error = %e, "Failed to mark {} started, holding it", task.info());
        self.held.push_front(task);
        return PollStep::Wait(shared.config.error_retry_delay);
      }
    };

    shared.processed.fetch_add(1, AtomicOrdering::Relaxed);
    BackendMetrics::incr(&shared.metrics.tasks_started);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    {
      let mut in_flight = shared.in_flight.lock();
      in_flight.insert(started.id, Some(cancel_tx));
      shared
        .metrics
        .tasks_in_flight
        .store(in_flight.len(), AtomicOrdering::Relaxed);
    }
    shared.publish(LifecycleEvent::Started, started.id).await;

    worker::spawn_execution(self.backend.clone(), job, started, cancel_rx);
    PollStep::Continue
  }

  /// Returns held tasks to the store queue so another poll can pick them up.
  async fn release_held(&mut self) {
    let shared = self.backend.shared.clone();
    while let Some(task) = self.held.pop_front() {
      match shared
        .store_retry("requeue", || shared.store.requeue(task.id))
        .await
      {
        Ok(true) => debug!("{} handed back to the queue", task.info()),
        Ok(false) => trace!("{} moved on while held", task.info()),
        Err(e) => error!(error = %e, "Failed to hand {} back to the queue", task.info()),
      }
    }
  }

  /// Sleeps for `delay`, returning early when an execution finishes or the
  /// shutdown signal changes.
  async fn idle(&mut self, delay: Duration) {
    tokio::select! {
      biased;
      _ = self.shutdown_rx.changed() => {}
      Some(outcome) = self.outcome_rx.recv() => record(&self.backend.shared, outcome),
      _ = sleep(delay) => {}
    }
  }

  /// After a graceful stop, waits until every in-flight execution reported back.
  async fn drain_in_flight(&mut self) {
    loop {
      let remaining = self.backend.shared.in_flight.lock().len();
      if remaining == 0 || self.shutdown_mode() == Some(ShutdownMode::Force) {
        break;
      }
      debug!(remaining, "Waiting for in-flight tasks.");
      tokio::select! {
        biased;
        changed = self.shutdown_rx.changed() => {
          if changed.is_err() {
            break;
          }
        }
        outcome = self.outcome_rx.recv() => match outcome {
          Some(outcome) => record(&self.backend.shared, outcome),
          None => break,
        },
      }
    }
  }
}

fn record(shared: &BackendShared, outcome: ExecutionOutcome) {
  trace!(
    task_id = %outcome.task_id,
    status = %outcome.status,
    duration_ms = outcome.duration.as_millis() as u64,
    in_flight = shared.in_flight.lock().len(),
    "Execution reported back."
  );
}

async fn finalize_unstarted(shared: &BackendShared, task: &Task, update: TaskUpdate) {
  if let Some(finished) = worker::finish_task(shared, task.id, update).await {
    worker::announce_done(shared, &finished).await;
  }
}

/// Fires due periodic entries, then sleeps until the next one is due
/// (capped at `max_tick_interval`).
pub(crate) async fn run_ticker(
  backend: TaskBackend,
  mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
  info!(backend = %backend.id(), "Periodic ticker started.");
  let max_wait = backend.shared.config.max_tick_interval;
  loop {
    if shutdown_rx.borrow().is_some() {
      break;
    }
    let next = backend.tick(Utc::now()).await;
    let wait = next.map_or(max_wait, |next| next.min(max_wait));
    trace!(wait_ms = wait.as_millis() as u64, "Ticker sleeping.");
    tokio::select! {
      biased;
      changed = shutdown_rx.changed() => {
        if changed.is_err() {
          break;
        }
      }
      _ = sleep(wait) => {}
    }
  }
  info!(backend = %backend.id(), "Periodic ticker stopped.");
}

/// Releases local waiters of tasks finished by other backends sharing the store.
pub(crate) async fn run_done_listener(
  backend: TaskBackend,
  mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
  let shared = &backend.shared;
  let channel = LifecycleEvent::Done.channel(&shared.config.name);
  let mut ids = match shared.notifier.subscribe(&channel).await {
    Ok(ids) => ids,
    Err(e) => {
      error!(%channel, error = %e, "Cannot subscribe to done channel.");
      return;
    }
  };
  debug!(%channel, "Done listener subscribed.");

  loop {
    tokio::select! {
      biased;
      changed = shutdown_rx.changed() => {
        if changed.is_err() || shutdown_rx.borrow().is_some() {
          break;
        }
      }
      next = ids.next() => match next {
        Some(task_id) => {
          if !shared.waiters.is_waiting(task_id) {
            continue;
          }
          match shared.store.get(task_id).await {
            Ok(Some(task)) if task.is_done() => {
              shared.waiters.release(&task);
            }
            Ok(_) => trace!(%task_id, "Done event for unfinished or unknown task."),
            Err(e) => warn!(%task_id, error = %e, "Cannot fetch finished task."),
          }
        }
        None => {
          warn!(%channel, "Done channel closed.");
          break;
        }
      },
    }
  }
  debug!(%channel, "Done listener stopped.");
}
