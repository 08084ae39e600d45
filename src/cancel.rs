use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`CancelSignal`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
  /// `cancel()` was called on the signal or one of its parents.
  Cancelled,
  /// The signal's deadline passed.
  DeadlineExceeded,
}

impl fmt::Display for CancelReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CancelReason::Cancelled => f.write_str("operation cancelled"),
      CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
    }
  }
}

/// A cooperative, cloneable cancellation signal shared by a pool, its workers
/// and the jobs they run.
///
/// Firing the signal never interrupts running code. Workers observe it only
/// while waiting for their next job; jobs must poll `is_cancelled()` or await
/// `cancelled()` themselves.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl CancelSignal {
  /// A signal that fires only when `cancel()` is called.
  pub fn new() -> Self {
    Self::default()
  }

  /// A signal that fires after `timeout` has elapsed, or on `cancel()`.
  ///
  /// A timeout too large to represent as an instant means no deadline.
  pub fn with_timeout(timeout: Duration) -> Self {
    Self {
      token: CancellationToken::new(),
      deadline: Instant::now().checked_add(timeout),
    }
  }

  /// A signal that fires at `deadline`, or on `cancel()`.
  pub fn with_deadline(deadline: Instant) -> Self {
    Self {
      token: CancellationToken::new(),
      deadline: Some(deadline),
    }
  }

  /// Derives a signal that fires whenever this one does, and can also be
  /// cancelled on its own without affecting the parent.
  pub fn child(&self) -> Self {
    Self {
      token: self.token.child_token(),
      deadline: self.deadline,
    }
  }

  /// Derives a child whose deadline is the earlier of the parent's and `timeout` from now.
  pub fn child_with_timeout(&self, timeout: Duration) -> Self {
    let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
      (Some(parent), Some(candidate)) => Some(parent.min(candidate)),
      (parent, candidate) => parent.or(candidate),
    };
    Self {
      token: self.token.child_token(),
      deadline,
    }
  }

  pub fn cancel(&self) {
    tracing::debug!("CancelSignal: cancellation requested.");
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.reason().is_some()
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// Returns why the signal fired, or `None` if it has not.
  ///
  /// Explicit cancellation wins over an expired deadline.
  pub fn reason(&self) -> Option<CancelReason> {
    if self.token.is_cancelled() {
      return Some(CancelReason::Cancelled);
    }
    match self.deadline {
      Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
      _ => None,
    }
  }

  /// Completes once the signal fires, returning the reason.
  pub async fn cancelled(&self) -> CancelReason {
    match self.deadline {
      Some(deadline) => {
        tokio::select! {
          biased;
          _ = self.token.cancelled() => CancelReason::Cancelled,
          _ = tokio::time::sleep_until(deadline) => {
            // The token may have fired in the same instant.
            self.reason().unwrap_or(CancelReason::DeadlineExceeded)
          }
        }
      }
      None => {
        self.token.cancelled().await;
        CancelReason::Cancelled
      }
    }
  }

  /// The underlying token, for code that already speaks `tokio_util`.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }
}

impl From<CancellationToken> for CancelSignal {
  fn from(token: CancellationToken) -> Self {
    Self { token, deadline: None }
  }
}
