use crate::error::BuildError;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of a `TaskBackend`.
///
/// Usually set through `TaskBackendBuilder`, but serializable so it can also be
/// loaded from a config file. Missing fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Scopes the lifecycle channels (`<name>_task_done`, ...) and the backend id.
  pub name: String,
  /// Maximum number of tasks this backend runs at the same time.
  pub backlog: usize,
  /// Tasks to process before requesting a restart. `0` disables the limit.
  pub max_tasks: u64,
  /// Long-poll timeout when fetching the next queued task.
  pub poll_timeout: Duration,
  /// Wait before polling again while the backlog is full.
  pub backpressure_delay: Duration,
  /// Wait before polling again after a store error.
  pub error_retry_delay: Duration,
  /// Run the periodic ticker when the backend starts.
  pub schedule_periodic: bool,
  /// Attempts for store writes that fail with `StoreError::Unavailable`.
  pub store_retry_attempts: u32,
  /// Upper bound on the ticker's sleep between checks.
  pub max_tick_interval: Duration,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      name: "taskqueue".to_string(),
      backlog: 5,
      max_tasks: 0,
      poll_timeout: Duration::from_secs(2),
      backpressure_delay: Duration::from_secs(1),
      error_retry_delay: Duration::from_millis(500),
      schedule_periodic: false,
      store_retry_attempts: 3,
      max_tick_interval: Duration::from_secs(30),
    }
  }
}

impl BackendConfig {
  pub fn validate(&self) -> Result<(), BuildError> {
    if self.name.trim().is_empty() {
      return Err(BuildError::EmptyName);
    }
    if self.backlog == 0 {
      return Err(BuildError::ZeroBacklog);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_validate() {
    let config = BackendConfig::default();
    assert_eq!(config.backlog, 5);
    assert_eq!(config.poll_timeout, Duration::from_secs(2));
    assert!(config.validate().is_ok());

    let bad = BackendConfig {
      backlog: 0,
      ..BackendConfig::default()
    };
    assert_eq!(bad.validate(), Err(BuildError::ZeroBacklog));
    let bad = BackendConfig {
      name: " ".into(),
      ..BackendConfig::default()
    };
    assert_eq!(bad.validate(), Err(BuildError::EmptyName));
  }

  #[test]
  fn partial_json_uses_defaults() {
    let config: BackendConfig =
      serde_json::from_str(r#"{"name": "mail", "backlog": 2}"#).unwrap();
    assert_eq!(config.name, "mail");
    assert_eq!(config.backlog, 2);
    assert_eq!(config.max_tasks, 0);
    assert!(!config.schedule_periodic);
  }
}
