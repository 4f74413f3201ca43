//! Taskwheel: A Task Queue Backend for Tokio
//!
//! Turns named job submissions into tracked tasks, runs them on a worker pool
//! under a concurrency ceiling, and notifies observers when they finish.
//!
//! # Features
//!
//! - Explicitly constructed [`JobRegistry`] of regular and periodic jobs.
//! - Task state machine `PENDING -> QUEUED -> STARTED -> {SUCCESS, FAILURE, REVOKED}`
//!   with an optional `RETRY` step.
//! - Deduplication of equivalent submissions through per-job overlap policies.
//! - Backlog-aware poll/dispatch loop with backpressure and a bounded task
//!   count per backend lifetime (`max_tasks`).
//! - Periodic scheduling with fixed intervals, optionally aligned to an anchor.
//! - Task expiry, explicit revocation, and panic containment.
//! - Lifecycle events on `<name>_task_created`, `<name>_task_start` and
//!   `<name>_task_done`, plus `wait_for_task` for callers that need the result.
//! - Pluggable [`TaskStore`], [`Notifier`] and [`WorkerPool`] collaborators with
//!   in-process defaults.
//! - Built-in metrics (`MetricsSnapshot`), graceful and forced shutdown.
//! - Optional task-local [`TaskContext`] for job bodies (`job_context` feature).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskwheel::{Job, JobArgs, JobRegistry, OverlapPolicy, TaskBackend, TaskMeta};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,taskwheel=info").init();
//!
//!     let mut registry = JobRegistry::new();
//!     registry.register(
//!         Job::regular("resize", |args: JobArgs| async move {
//!             let path: String = args.positional(0)?;
//!             Ok(serde_json::json!({ "resized": path }))
//!         })
//!         .with_overlap(OverlapPolicy::Deny)
//!         .with_timeout(Duration::from_secs(60)),
//!     )?;
//!     registry.register(Job::periodic("cleanup", Duration::from_secs(3600), |_args| async {
//!         Ok(serde_json::Value::Null)
//!     }))?;
//!
//!     let backend = TaskBackend::builder(Arc::new(registry))
//!         .name("images")
//!         .backlog(4)
//!         .schedule_periodic(true)
//!         .build()?;
//!     backend.start();
//!
//!     let submission = backend
//!         .submit("resize", JobArgs::new().arg("cat.png"), TaskMeta::new())
//!         .await?;
//!     let task = backend
//!         .wait_for_task(submission.task_id(), Some(Duration::from_secs(90)))
//!         .await?;
//!     println!("{} -> {:?}", task, task.result);
//!
//!     backend.shutdown_graceful(Some(Duration::from_secs(30))).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
mod coordinator;
pub mod error;
pub mod job;
mod macros;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;
mod waiters;
pub mod worker;

// --- Public Re-exports ---

pub use backend::{Submission, TaskBackend, TaskBackendBuilder};
pub use command::ShutdownMode;
pub use config::BackendConfig;
pub use error::{
  BuildError, ExecutionError, JobError, NotifyError, QueryError, RegistryError, ShutdownError,
  StoreError, SubmitError, WaitError,
};
pub use job::{anchor_at, Job, JobArgs, JobInfo, JobKind, JobResult, OverlapPolicy, Recurrence};
pub use metrics::MetricsSnapshot;
pub use notify::{LifecycleEvent, LocalNotifier, Notifier, TaskIdStream};
pub use registry::JobRegistry;
pub use scheduler::{DueStatus, PeriodicScheduler, SchedulerEntry};
pub use store::{InMemoryTaskStore, TaskStore};
pub use task::{Task, TaskFilter, TaskId, TaskMeta, TaskResult, TaskStatus, TaskUpdate};
pub use worker::{TokioWorkerPool, WorkerPool};

#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_task_context, TaskContext};
