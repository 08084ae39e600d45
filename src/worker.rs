use crate::cancel::CancelSignal;
use crate::error::JobError;
use crate::job::{Descriptor, Job, JobResult};
use crate::queue::{QueueConsumer, QueueProducer};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, error, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_JOB_SEQ: AtomicU64 = AtomicU64::new(0);
}

/// Descriptors of the jobs currently executing, keyed by dequeue sequence number.
pub type ActiveJobs = Arc<DashMap<u64, Descriptor>>;

/// An execution loop that moves jobs from a job queue to a result queue.
///
/// A worker owns nothing but a label for its logs and, when spawned by a
/// pool, the shared table of in-flight jobs. Any number of workers can share
/// the same queues.
#[derive(Debug, Clone, Default)]
pub struct Worker {
  id: usize,
  active_jobs: Option<ActiveJobs>,
}

impl Worker {
  pub fn new(id: usize) -> Self {
    Self { id, active_jobs: None }
  }

  /// A worker that records every job it runs in `active_jobs` until the job finishes.
  pub fn tracked(id: usize, active_jobs: ActiveJobs) -> Self {
    Self {
      id,
      active_jobs: Some(active_jobs),
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  /// Runs until `jobs` is closed and drained, or until `cancel` fires while
  /// the worker is waiting for a job.
  ///
  /// On cancellation the worker publishes one result with an empty descriptor
  /// and a `JobError::Cancelled` error, then returns without touching any
  /// jobs still queued. A job that is already executing is never interrupted.
  pub async fn run<A, T>(
    &self,
    cancel: &CancelSignal,
    jobs: &QueueConsumer<Job<A, T>>,
    results: &QueueProducer<JobResult<T>>,
  ) where
    A: Send + 'static,
    T: Send + 'static,
  {
    debug!(worker_id = self.id, "Worker started.");

    loop {
      let next = tokio::select! {
        biased;

        reason = cancel.cancelled() => {
          info!(worker_id = self.id, %reason, "Cancellation signal received while waiting for a job. Worker exiting.");
          let notice = JobResult::failure(Descriptor::default(), JobError::Cancelled(reason));
          if results.send(notice).await.is_err() {
            warn!(worker_id = self.id, "Result queue has no consumers, cancellation notice dropped.");
          }
          return;
        }

        job = jobs.recv() => job,
      };

      let Some(job) = next else {
        debug!(worker_id = self.id, "Job queue closed and empty. Worker exiting.");
        return;
      };

      let result = self.execute(job, cancel).await;
      if results.send(result).await.is_err() {
        warn!(worker_id = self.id, "Result queue has no consumers. Worker exiting.");
        return;
      }
    }
  }

  async fn execute<A, T>(&self, job: Job<A, T>, cancel: &CancelSignal) -> JobResult<T>
  where
    A: Send + 'static,
    T: Send + 'static,
  {
    let seq = NEXT_JOB_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
    let descriptor = job.descriptor().clone();
    if let Some(active_jobs) = &self.active_jobs {
      active_jobs.insert(seq, descriptor.clone());
    }
    trace!(worker_id = self.id, job_seq = seq, job_id = %descriptor.id(), "Executing job.");

    let result = match AssertUnwindSafe(job.exec(cancel)).catch_unwind().await {
      Ok(result) => {
        trace!(worker_id = self.id, job_seq = seq, job_id = %descriptor.id(), ok = result.is_ok(), "Job finished.");
        result
      }
      Err(_panic_payload) => {
        error!(worker_id = self.id, job_seq = seq, job_id = %descriptor.id(), "Job panicked during execution.");
        JobResult::failure(descriptor, JobError::Panicked)
      }
    };

    if let Some(active_jobs) = &self.active_jobs {
      active_jobs.remove(&seq);
    }
    result
  }
}
