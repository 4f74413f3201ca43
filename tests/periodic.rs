//! tests/periodic.rs
//! Periodic jobs: due detection through `tick`, anchors, and the ticker loop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{add_job, build_backend, setup_tracing};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use taskwheel::{
  Job, JobKind, JobRegistry, OverlapPolicy, TaskBackend, TaskFilter, TaskStatus,
};

fn beat_job(counter: Arc<AtomicUsize>, every: StdDuration) -> Job {
  Job::periodic("beat", every, move |_args| {
    let ctr = counter.clone();
    async move {
      ctr.fetch_add(1, Ordering::SeqCst);
      Ok(Value::Null)
    }
  })
}

#[tokio::test]
async fn test_interval_ticks() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  registry
    .register(beat_job(Arc::new(AtomicUsize::new(0)), StdDuration::from_secs(10)))
    .unwrap();
  // Not started: fired tasks stay queued and can be counted.
  let backend = build_backend(registry, 1).unwrap();
  let beats = TaskFilter::new().with_name("beat");

  let t0 = Utc::now();
  let next = backend.tick(t0).await;
  assert_eq!(next, Some(StdDuration::from_secs(10)));
  assert_eq!(backend.list_tasks(&beats).await.unwrap().len(), 1);

  let next = backend.tick(t0 + ChronoDuration::seconds(5)).await;
  assert_eq!(next, Some(StdDuration::from_secs(5)));
  assert_eq!(backend.list_tasks(&beats).await.unwrap().len(), 1);

  let next = backend.tick(t0 + ChronoDuration::seconds(9)).await;
  assert_eq!(next, Some(StdDuration::from_secs(1)));
  assert_eq!(backend.list_tasks(&beats).await.unwrap().len(), 1);

  backend.tick(t0 + ChronoDuration::seconds(11)).await;
  let tasks = backend.list_tasks(&beats).await.unwrap();
  assert_eq!(tasks.len(), 2);
  assert!(tasks.iter().all(|t| t.status == TaskStatus::Queued));

  let snapshot = backend.metrics_snapshot();
  assert_eq!(snapshot.periodic_fired, 2);
  assert_eq!(snapshot.tasks_submitted, 2);
}

#[tokio::test]
async fn test_anchored_ticks() {
  setup_tracing();
  let anchor = Utc.with_ymd_and_hms(2024, 3, 1, 10, 25, 0).unwrap();
  let mut registry = JobRegistry::new();
  registry
    .register(
      beat_job(Arc::new(AtomicUsize::new(0)), StdDuration::from_secs(3600)).with_anchor(anchor),
    )
    .unwrap();
  let backend = build_backend(registry, 1).unwrap();
  let beats = TaskFilter::new().with_name("beat");

  // 10:40: the last boundary was 10:25, the next is 11:25.
  let next = backend.tick(anchor + ChronoDuration::minutes(15)).await;
  assert_eq!(next, Some(StdDuration::from_secs(45 * 60)));
  assert!(backend.list_tasks(&beats).await.unwrap().is_empty());

  // 11:25 sharp.
  let next = backend.tick(anchor + ChronoDuration::hours(1)).await;
  assert_eq!(next, Some(StdDuration::from_secs(3600)));
  assert_eq!(backend.list_tasks(&beats).await.unwrap().len(), 1);

  // A late tick at 11:40 is still aligned to 11:25.
  let next = backend
    .tick(anchor + ChronoDuration::minutes(75))
    .await;
  assert_eq!(next, Some(StdDuration::from_secs(45 * 60)));
  assert_eq!(backend.list_tasks(&beats).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_periodic_overlap_suppression() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  registry
    .register(
      beat_job(Arc::new(AtomicUsize::new(0)), StdDuration::from_secs(10))
        .with_overlap(OverlapPolicy::Deny),
    )
    .unwrap();
  let backend = build_backend(registry, 1).unwrap();

  let t0 = Utc::now();
  backend.tick(t0).await;
  backend.tick(t0 + ChronoDuration::seconds(10)).await;

  // The first task is still queued, so the second fire is suppressed.
  let tasks = backend
    .list_tasks(&TaskFilter::new().with_name("beat"))
    .await
    .unwrap();
  assert_eq!(tasks.len(), 1);
  let snapshot = backend.metrics_snapshot();
  assert_eq!(snapshot.periodic_fired, 2);
  assert_eq!(snapshot.tasks_suppressed, 1);
}

#[tokio::test]
async fn test_list_jobs_and_next_scheduled() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  registry
    .register(add_job().with_doc("Adds two numbers."))
    .unwrap();
  registry
    .register(beat_job(Arc::new(AtomicUsize::new(0)), StdDuration::from_secs(60)))
    .unwrap();
  registry
    .register(
      Job::periodic("slow_beat", StdDuration::from_secs(600), |_args| async {
        Ok(Value::Null)
      })
      .with_overlap(OverlapPolicy::Deny),
    )
    .unwrap();
  let backend = build_backend(registry, 1).unwrap();

  let jobs = backend.list_jobs();
  let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
  assert_eq!(names, ["add", "beat", "slow_beat"]);

  let add = &jobs[0];
  assert_eq!(add.kind, JobKind::Regular);
  assert_eq!(add.doc.as_deref(), Some("Adds two numbers."));
  assert_eq!(add.can_overlap, "yes");
  assert_eq!(add.run_every, None);
  assert_eq!(add.next_run_in, None);

  let slow = &jobs[2];
  assert_eq!(slow.kind, JobKind::Periodic);
  assert_eq!(slow.can_overlap, "no");
  assert_eq!(slow.run_every, Some(StdDuration::from_secs(600)));
  // Never fired: due now.
  assert_eq!(slow.next_run_in, Some(StdDuration::ZERO));
  assert_eq!(slow.runs_count, Some(0));

  backend.tick(Utc::now()).await;
  let jobs = backend.list_jobs();
  assert_eq!(jobs[1].runs_count, Some(1));
  assert_eq!(jobs[2].runs_count, Some(1));

  let (name, wait) = backend.next_scheduled(None).unwrap();
  assert_eq!(name, "beat");
  assert!(wait <= StdDuration::from_secs(60));
  assert!(wait > StdDuration::from_secs(50));

  let (name, wait) = backend.next_scheduled(Some(&["slow_beat"][..])).unwrap();
  assert_eq!(name, "slow_beat");
  assert!(wait > StdDuration::from_secs(590));

  assert!(backend.next_scheduled(Some(&["add"][..])).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ticker_runs_periodic_jobs() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  registry
    .register(beat_job(counter.clone(), StdDuration::from_millis(200)))
    .unwrap();
  let backend = TaskBackend::builder(Arc::new(registry))
    .schedule_periodic(true)
    .poll_timeout(StdDuration::from_millis(50))
    .build()
    .unwrap();
  backend.start();

  tokio::time::sleep(StdDuration::from_millis(750)).await;
  backend
    .shutdown_graceful(Some(StdDuration::from_secs(5)))
    .await
    .unwrap();

  let runs = counter.load(Ordering::SeqCst);
  assert!(runs >= 2, "Periodic job should have run at least twice (ran {})", runs);
  assert!(runs <= 5, "Periodic job ran too often ({})", runs);
}

#[tokio::test]
async fn test_zero_interval_is_rejected() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  let result = registry.register(beat_job(Arc::new(AtomicUsize::new(0)), StdDuration::ZERO));
  assert!(result.is_err());
  assert!(registry.is_empty());
}
