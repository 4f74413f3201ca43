//! tests/store.rs
//! Shared stores, custom worker pools and store maintenance through the backend.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{add_job, build_backend, setup_tracing};
use serde_json::json;
use taskwheel::{
  InMemoryTaskStore, JobArgs, JobRegistry, LocalNotifier, Notifier, TaskBackend, TaskFilter,
  TaskMeta, TaskResult, TaskStatus, TaskStore, TokioWorkerPool,
};

#[tokio::test]
async fn test_pending_count_delete_and_flush() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  registry.register(add_job()).unwrap();
  let store = Arc::new(InMemoryTaskStore::new());
  let backend = TaskBackend::builder(Arc::new(registry))
    .store(store.clone())
    .build()
    .unwrap();

  let mut ids = Vec::new();
  for i in 0..3 {
    let submission = backend
      .submit("add", JobArgs::new().arg(i).arg(i), TaskMeta::new())
      .await
      .unwrap();
    ids.push(submission.task_id());
  }
  assert_eq!(store.count_pending().await.unwrap(), 3);

  let selected = backend
    .list_tasks(&TaskFilter::new().with_ids(vec![ids[0], ids[2]]))
    .await
    .unwrap();
  assert_eq!(selected.len(), 2);

  let deleted = store.delete(&[ids[1], uuid::Uuid::new_v4()]).await.unwrap();
  assert_eq!(deleted, vec![ids[1]]);
  assert_eq!(store.count_pending().await.unwrap(), 2);
  assert!(backend.get_task(ids[1]).await.is_err());

  backend.flush().await.unwrap();
  assert!(store.is_empty());
}

#[tokio::test]
async fn test_two_backends_share_one_store() {
  setup_tracing();
  let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
  let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new());
  let build = || {
    let mut registry = JobRegistry::new();
    registry.register(add_job()).unwrap();
    TaskBackend::builder(Arc::new(registry))
      .backlog(1)
      .store(store.clone())
      .notifier(notifier.clone())
      .poll_timeout(StdDuration::from_millis(50))
      .build()
      .unwrap()
  };
  let first = build();
  let second = build();
  first.start();
  second.start();

  let mut ids = Vec::new();
  for i in 0..6 {
    let submission = first
      .submit("add", JobArgs::new().arg(i).arg(1), TaskMeta::new())
      .await
      .unwrap();
    ids.push(submission.task_id());
  }
  for (i, id) in ids.iter().enumerate() {
    let task = first
      .wait_for_task(*id, Some(StdDuration::from_secs(5)))
      .await
      .unwrap();
    assert_eq!(task.result, Some(TaskResult::Value(json!(i as i64 + 1))));
  }

  // Every task ran exactly once, on one of the two backends. Tasks finished by
  // the second backend reach waiters on the first through the shared notifier.
  assert_eq!(first.processed() + second.processed(), 6);
  let done = store
    .list(&TaskFilter::new().with_status(TaskStatus::Success))
    .await
    .unwrap();
  assert_eq!(done.len(), 6);
  assert!(done
    .iter()
    .all(|t| t.worker.as_deref() == Some(first.id()) || t.worker.as_deref() == Some(second.id())));

  first.shutdown_graceful(None).await.unwrap();
  second.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_custom_worker_pool_runtime() {
  setup_tracing();
  let mut registry = JobRegistry::new();
  registry.register(add_job()).unwrap();
  let backend = TaskBackend::builder(Arc::new(registry))
    .worker_pool(Arc::new(TokioWorkerPool::on_runtime(
      tokio::runtime::Handle::current(),
    )))
    .poll_timeout(StdDuration::from_millis(50))
    .build()
    .unwrap();
  backend.start();

  let submission = backend
    .submit("add", JobArgs::new().arg(40).arg(2), TaskMeta::new())
    .await
    .unwrap();
  let task = backend
    .wait_for_task(submission.task_id(), Some(StdDuration::from_secs(5)))
    .await
    .unwrap();
  assert_eq!(task.result, Some(TaskResult::Value(json!(42))));

  let snapshot = backend.metrics_snapshot();
  assert_eq!(snapshot.task_execution_duration_count, 1);
  assert!(snapshot.mean_execution_duration().is_some());

  backend.shutdown_graceful(None).await.unwrap();
}

#[tokio::test]
async fn test_build_rejects_zero_backlog() {
  setup_tracing();
  let result = build_backend(JobRegistry::new(), 0);
  assert!(matches!(result, Err(taskwheel::BuildError::ZeroBacklog)));
}
