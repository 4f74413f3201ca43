/// Builds a job body closure accepted by `Job::regular` and `Job::periodic`.
///
/// Takes the name bound to the task's `JobArgs`, an optional synchronous setup
/// block, and the async body. Both run on every execution: the setup block
/// first (typically cloning captured handles), then the body, which must
/// evaluate to a `JobResult`.
///
/// # Usage
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use taskwheel::job::Job;
/// use taskwheel::job_fn;
///
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let counting = Job::regular("count", job_fn! {
///     |args|
///     {
///         let counter = counter.clone();
///     }
///     {
///         let step: usize = args.positional(0)?;
///         let total = counter.fetch_add(step, Ordering::SeqCst) + step;
///         Ok(serde_json::json!(total))
///     }
/// });
///
/// let ping = Job::regular("ping", job_fn! {
///     |_args|
///     {
///         Ok(serde_json::json!("pong"))
///     }
/// });
/// # let _ = (counting, ping);
/// ```
#[macro_export]
macro_rules! job_fn {
    // Setup block followed by the body.
    (
        |$args:pat_param|
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        move |$args: $crate::job::JobArgs| {
            $($setup_stmts)*

            $crate::job::box_job_future(async move { $main_block })
        }
    };

    // Body only.
    (
        |$args:pat_param|
        $main_block:block
    ) => {
        move |$args: $crate::job::JobArgs| {
            $crate::job::box_job_future(async move { $main_block })
        }
    };
}
