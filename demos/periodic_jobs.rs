//! demos/periodic_jobs.rs
//!
//! Runs an interval job and an anchored job with the periodic ticker enabled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use taskwheel::{job_fn, Job, JobRegistry, TaskBackend};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,taskwheel=info,periodic_jobs=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let heartbeats = Arc::new(AtomicUsize::new(0));
  let beats = heartbeats.clone();

  // --- Register Jobs ---
  let mut registry = JobRegistry::new();
  registry.register(Job::periodic(
    "heartbeat",
    StdDuration::from_secs(1),
    job_fn! {
      |_args|
      {
        let counter = beats.clone();
      }
      {
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!("*** Heartbeat (Count: {}) ***", count);
        Ok(json!(count))
      }
    },
  ))?;
  // Aligned to a boundary that falls a couple of seconds from now.
  let anchor = Utc::now() + ChronoDuration::seconds(2);
  registry.register(
    Job::periodic(
      "aligned",
      StdDuration::from_secs(3),
      job_fn! {
        |_args|
        {
          info!("*** Aligned run at {} ***", Utc::now().format("%H:%M:%S%.3f"));
          Ok(serde_json::Value::Null)
        }
      },
    )
    .with_anchor(anchor),
  )?;

  // --- Build Backend ---
  let backend = TaskBackend::builder(Arc::new(registry))
    .name("periodic_demo")
    .schedule_periodic(true)
    .max_tick_interval(StdDuration::from_secs(1))
    .build()?;
  backend.start();

  if let Some((name, wait)) = backend.next_scheduled(None) {
    info!("Next periodic job: {} in {:?}", name, wait);
  }

  tokio::time::sleep(StdDuration::from_secs(7)).await;

  for job in backend.list_jobs() {
    info!(
      name = %job.name,
      runs = ?job.runs_count,
      next_run_in = ?job.next_run_in,
      "Periodic job state"
    );
  }

  // --- Shutdown ---
  match backend
    .shutdown_graceful(Some(StdDuration::from_secs(5)))
    .await
  {
    Ok(()) => info!("Backend shut down gracefully."),
    Err(e) => warn!("Shutdown error: {}", e),
  }
  info!("Heartbeats run: {}", heartbeats.load(Ordering::Relaxed));
  Ok(())
}
