//! demos/submit_and_wait.rs
//!
//! Submits a few tasks, shows overlap suppression, and waits for results.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::json;
use taskwheel::{job_fn, Job, JobArgs, JobRegistry, OverlapPolicy, TaskBackend, TaskMeta};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,taskwheel=info,submit_and_wait=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Register Jobs ---
  let mut registry = JobRegistry::new();
  registry.register(
    Job::regular(
      "add",
      job_fn! {
        |args|
        {
          let a: i64 = args.positional(0)?;
          let b: i64 = args.positional(1)?;
          Ok(json!(a + b))
        }
      },
    )
    .with_doc("Adds two integers."),
  )?;
  registry.register(
    Job::regular(
      "report",
      job_fn! {
        |args|
        {
          let day: String = args.positional(0)?;
          info!("Building report for {}", day);
          tokio::time::sleep(StdDuration::from_millis(500)).await;
          Ok(json!({ "day": day, "rows": 42 }))
        }
      },
    )
    .with_overlap(OverlapPolicy::Deny)
    .with_timeout(StdDuration::from_secs(5)),
  )?;

  // --- Build Backend ---
  let backend = TaskBackend::builder(Arc::new(registry))
    .name("demo")
    .backlog(2)
    .build()?;
  backend.start();

  for job in backend.list_jobs() {
    info!(name = %job.name, kind = %job.kind, can_overlap = %job.can_overlap, "Registered job");
  }

  // --- Submit ---
  let sum = backend
    .submit("add", JobArgs::new().arg(2).arg(3), TaskMeta::new())
    .await?;
  let report = backend
    .submit("report", JobArgs::new().arg("2024-03-01"), TaskMeta::new())
    .await?;
  let duplicate = backend
    .submit("report", JobArgs::new().arg("2024-03-01"), TaskMeta::new())
    .await?;
  info!(
    suppressed = duplicate.is_suppressed(),
    same_task = duplicate.task_id() == report.task_id(),
    "Submitted duplicate report"
  );

  // --- Wait ---
  for submission in [sum, report] {
    let task = backend
      .wait_for_task(submission.task_id(), Some(StdDuration::from_secs(10)))
      .await?;
    info!("{} -> {:?}", task, task.result);
  }

  info!("Metrics: {:#?}", backend.metrics_snapshot());
  backend
    .shutdown_graceful(Some(StdDuration::from_secs(5)))
    .await?;
  Ok(())
}
