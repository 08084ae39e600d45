use crate::error::PoolError;

use std::time::Duration;

/// Upper bound on the number of workers a single pool may spawn.
pub const MAX_WORKERS: usize = 1000;

/// How long `start` waits for an immediate failure of the background run.
pub const DEFAULT_START_GRACE: Duration = Duration::from_secs(1);

/// Settings for a [`WorkerPool`](crate::WorkerPool).
///
/// `worker_count == 0` means "one worker per available CPU".
/// `buffer_size` is the capacity of both the job and the result queue;
/// `0` makes every hand-off synchronous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  pub name: String,
  pub worker_count: usize,
  pub buffer_size: usize,
  pub start_grace: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "worker_pool".to_string(),
      worker_count: 0,
      buffer_size: 0,
      start_grace: DEFAULT_START_GRACE,
    }
  }
}

impl PoolConfig {
  pub fn new(worker_count: usize, buffer_size: usize) -> Self {
    Self {
      worker_count,
      buffer_size,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_worker_count(mut self, worker_count: usize) -> Self {
    self.worker_count = worker_count;
    self
  }

  pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
    self.buffer_size = buffer_size;
    self
  }

  pub fn with_start_grace(mut self, start_grace: Duration) -> Self {
    self.start_grace = start_grace;
    self
  }

  /// Checks the limits and returns a copy with the worker count resolved.
  pub fn validate(&self) -> Result<PoolConfig, PoolError> {
    if self.worker_count > MAX_WORKERS {
      return Err(PoolError::InvalidWorkerCount(self.worker_count));
    }
    let mut resolved = self.clone();
    if resolved.worker_count == 0 {
      resolved.worker_count = num_cpus::get().clamp(1, MAX_WORKERS);
    }
    Ok(resolved)
  }
}
