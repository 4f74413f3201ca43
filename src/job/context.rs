use crate::backend::{Submission, TaskBackend};
use crate::error::SubmitError;
use crate::job::JobArgs;
use crate::task::{TaskId, TaskMeta};

use std::fmt;

/// Contextual information available to a running job body via task-locals.
/// Accessible with `try_get_current_task_context()` or the `task_context!()`
/// macro when the `job_context` feature is enabled.
#[derive(Clone)]
pub struct TaskContext {
  /// Id of the task being executed.
  pub task_id: TaskId,
  /// Name of the job the task invokes.
  pub job_name: String,
  /// How many times this task has been retried so far.
  pub retries: u32,
  backend: TaskBackend,
}

impl TaskContext {
  pub(crate) fn new(task_id: TaskId, job_name: &str, retries: u32, backend: TaskBackend) -> Self {
    Self {
      task_id,
      job_name: job_name.to_string(),
      retries,
      backend,
    }
  }

  /// Submits a follow-up task. The new task records this one as `from_task`.
  pub async fn submit(
    &self,
    job_name: &str,
    args: JobArgs,
    meta: TaskMeta,
  ) -> Result<Submission, SubmitError> {
    self
      .backend
      .submit(job_name, args, meta.with_from_task(self.task_id))
      .await
  }

  /// The backend executing this task.
  pub fn backend(&self) -> &TaskBackend {
    &self.backend
  }
}

impl fmt::Debug for TaskContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskContext")
      .field("task_id", &self.task_id)
      .field("job_name", &self.job_name)
      .field("retries", &self.retries)
      .field("backend", &self.backend.id())
      .finish()
  }
}

tokio::task_local! {
    /// Provides access to the current `TaskContext` within a job body.
    /// Set by the backend's executor when the `job_context` feature is enabled.
    pub static CURRENT_TASK_CONTEXT: TaskContext;
}

/// Attempts to retrieve the `TaskContext` of the executing job body.
///
/// Returns `None` outside a backend-managed execution.
pub fn try_get_current_task_context() -> Option<TaskContext> {
  CURRENT_TASK_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `TaskContext`.
///
/// # Panics
/// Panics if called outside a backend-managed job body.
/// Use `try_get_current_task_context()` for optional access.
#[macro_export]
macro_rules! task_context {
  () => {
    $crate::job::context::CURRENT_TASK_CONTEXT.with(|ctx| ctx.clone())
  };
}
