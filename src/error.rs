use crate::cancel::CancelReason;
use crate::config::MAX_WORKERS;

use thiserror::Error;

/// Errors returned synchronously by pool construction and lifecycle calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Number of workers must be between 0 and {max}, got {0}", max = MAX_WORKERS)]
  InvalidWorkerCount(usize),

  #[error("Pool is already running")]
  AlreadyRunning,

  #[error("Pool is stopped, construct a new pool")]
  AlreadyStopped,

  #[error("Pool is shutting down or already shut down, cannot accept new jobs")]
  PoolShuttingDown,

  #[error("Pool's internal job queue was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Background run of the pool failed to join: {0}")]
  RunJoinError(String),
}

/// Errors carried inside a [`JobResult`](crate::JobResult).
///
/// These never leave the pool out-of-band; a consumer sees them only by
/// reading the result stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
  #[error("{0}")]
  Failed(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("{0}")]
  Cancelled(CancelReason),

  #[error("job panicked during execution")]
  Panicked,
}

impl JobError {
  /// Builds a `Failed` error from anything printable.
  pub fn failed(message: impl std::fmt::Display) -> Self {
    JobError::Failed(message.to_string())
  }

  pub fn is_cancellation(&self) -> bool {
    matches!(self, JobError::Cancelled(_))
  }
}
