use crate::error::RegistryError;
use crate::job::{Job, JobKind};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

/// Name-keyed table of job definitions.
///
/// Constructed once at startup, then shared read-only (usually behind an `Arc`)
/// with every backend. Iteration is ordered by job name.
#[derive(Debug, Default)]
pub struct JobRegistry {
  jobs: BTreeMap<String, Arc<Job>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds a job, rejecting duplicate names and periodic jobs without a positive interval.
  pub fn register(&mut self, job: Job) -> Result<(), RegistryError> {
    if self.jobs.contains_key(job.name()) {
      return Err(RegistryError::DuplicateJob(job.name().to_string()));
    }
    self.replace(job).map(|_| ())
  }

  /// Adds a job, replacing and returning any job previously registered under that name.
  pub fn replace(&mut self, job: Job) -> Result<Option<Arc<Job>>, RegistryError> {
    if let Some(recurrence) = job.recurrence() {
      if recurrence.run_every.is_zero() {
        return Err(RegistryError::InvalidRunEvery(job.name().to_string()));
      }
    }
    debug!(job = job.name(), kind = %job.kind(), "Registering job.");
    Ok(self.jobs.insert(job.name().to_string(), Arc::new(job)))
  }

  /// Chaining form of [`register`](Self::register).
  pub fn with_job(mut self, job: Job) -> Result<Self, RegistryError> {
    self.register(job)?;
    Ok(self)
  }

  pub fn lookup(&self, name: &str) -> Option<Arc<Job>> {
    self.jobs.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.jobs.contains_key(name)
  }

  /// Jobs of the given kind, or all jobs, in name order.
  pub fn list(&self, kind: Option<JobKind>) -> Vec<Arc<Job>> {
    self
      .jobs
      .values()
      .filter(|job| kind.map_or(true, |k| job.kind() == k))
      .cloned()
      .collect()
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }
}
