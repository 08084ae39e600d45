use crate::cancel::CancelSignal;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::job::{Descriptor, Job, JobResult};
use crate::queue::{BoundedQueue, QueueConsumer, QueueProducer, ResultStream};
use crate::worker::{ActiveJobs, Worker};

use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Lifecycle of a [`WorkerPool`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
  /// Constructed, workers not spawned yet. Jobs may already be queued.
  Created = 0,
  /// Workers are consuming the job queue.
  Running = 1,
  /// The job queue is closed; workers are draining what is left.
  Stopping = 2,
  /// Every worker has exited and the result stream is closed.
  Stopped = 3,
}

impl From<u8> for PoolState {
  fn from(value: u8) -> Self {
    match value {
      0 => PoolState::Created,
      1 => PoolState::Running,
      2 => PoolState::Stopping,
      _ => PoolState::Stopped,
    }
  }
}

/// A fixed-size group of workers fed by a bounded job queue and draining
/// into a bounded result queue.
///
/// A pool is single use: once it reaches [`PoolState::Stopped`] it cannot be
/// run again.
pub struct WorkerPool<A: Send + 'static, T: Send + 'static> {
  pool_name: Arc<String>,
  config: PoolConfig,
  cancel: CancelSignal,
  state: AtomicU8,
  job_producer: Mutex<Option<QueueProducer<Job<A, T>>>>,
  job_consumer: Mutex<Option<QueueConsumer<Job<A, T>>>>,
  job_drain: QueueConsumer<Job<A, T>>,
  result_producer: Mutex<Option<QueueProducer<JobResult<T>>>>,
  results: ResultStream<T>,
  active_jobs: ActiveJobs,
  stopped_tx: watch::Sender<bool>,
  tokio_handle: TokioHandle,
  run_join_handle: Mutex<Option<JoinHandle<Result<(), PoolError>>>>,
}

impl<A: Send + 'static, T: Send + 'static> WorkerPool<A, T> {
  /// Creates a pool with `worker_count` workers (0 means one per CPU) and
  /// queues of capacity `buffer_size`.
  pub fn new(
    cancel: CancelSignal,
    worker_count: usize,
    buffer_size: usize,
    tokio_handle: TokioHandle,
  ) -> Result<Arc<Self>, PoolError> {
    Self::from_config(PoolConfig::new(worker_count, buffer_size), cancel, tokio_handle)
  }

  /// Creates a pool from a full [`PoolConfig`], validating it first.
  ///
  /// # Errors
  /// `PoolError::InvalidWorkerCount` if the worker count exceeds [`MAX_WORKERS`](crate::MAX_WORKERS).
  pub fn from_config(
    config: PoolConfig,
    cancel: CancelSignal,
    tokio_handle: TokioHandle,
  ) -> Result<Arc<Self>, PoolError> {
    let config = config.validate().inspect_err(|e| {
      error!(pool_name = %config.name, "Rejected pool configuration: {}", e);
    })?;

    let (job_producer, job_consumer) = BoundedQueue::new(config.buffer_size).split();
    let (result_producer, results) = BoundedQueue::new(config.buffer_size).split();
    let (stopped_tx, _) = watch::channel(false);

    info!(
      pool_name = %config.name,
      worker_count = config.worker_count,
      buffer_size = config.buffer_size,
      "Worker pool created."
    );

    Ok(Arc::new(Self {
      pool_name: Arc::new(config.name.clone()),
      config,
      cancel,
      state: AtomicU8::new(PoolState::Created as u8),
      job_producer: Mutex::new(Some(job_producer)),
      job_drain: job_consumer.clone(),
      job_consumer: Mutex::new(Some(job_consumer)),
      result_producer: Mutex::new(Some(result_producer)),
      results,
      active_jobs: Arc::new(DashMap::new()),
      stopped_tx,
      tokio_handle,
      run_join_handle: Mutex::new(None),
    }))
  }

  /// Pool name used in log fields.
  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of workers, after resolving 0 to the CPU count.
  pub fn worker_count(&self) -> usize {
    self.config.worker_count
  }

  /// Capacity of the job and result queues. 0 means unbuffered.
  pub fn buffer_size(&self) -> usize {
    self.config.buffer_size
  }

  /// Current lifecycle state.
  pub fn state(&self) -> PoolState {
    PoolState::from(self.state.load(AtomicOrdering::Acquire))
  }

  /// The signal the workers watch. Cancelling it makes idle workers exit.
  pub fn cancel_signal(&self) -> &CancelSignal {
    &self.cancel
  }

  /// Number of jobs waiting in the job queue. Reports 0 once the queue has been closed.
  pub fn queued_job_count(&self) -> usize {
    self.job_producer.lock().as_ref().map_or(0, QueueProducer::len)
  }

  /// Number of jobs workers are executing right now.
  pub fn in_flight_count(&self) -> usize {
    self.active_jobs.len()
  }

  /// Descriptors of the jobs workers are executing right now.
  pub fn in_flight(&self) -> Vec<Descriptor> {
    self.active_jobs.iter().map(|entry| entry.value().clone()).collect()
  }

  /// Spawns the workers and waits until all of them have exited.
  ///
  /// Workers exit once [`stop`](Self::stop) has closed the job queue and it is
  /// drained, or when the cancellation signal fires.
  ///
  /// # Errors
  /// `PoolError::AlreadyRunning` if the pool was already run, and
  /// `PoolError::AlreadyStopped` if it is stopping or stopped.
  pub async fn run(&self) -> Result<(), PoolError> {
    self.transition_to_running()?;

    let jobs = self.job_consumer.lock().take();
    let results = self.result_producer.lock().take();
    let (Some(jobs), Some(results)) = (jobs, results) else {
      error!(pool_name = %*self.pool_name, "Queue endpoints missing while entering Running.");
      self.mark_stopped();
      return Err(PoolError::AlreadyStopped);
    };

    info!(pool_name = %*self.pool_name, worker_count = self.config.worker_count, "Spawning workers.");
    let handles: Vec<JoinHandle<()>> = (0..self.config.worker_count)
      .map(|worker_id| {
        let worker = Worker::tracked(worker_id, self.active_jobs.clone());
        let cancel = self.cancel.clone();
        let jobs = jobs.clone();
        let results = results.clone();
        self.tokio_handle.spawn(
          async move {
            worker.run(&cancel, &jobs, &results).await;
          }
          .instrument(info_span!("pool_worker", pool_name = %*self.pool_name, worker_id)),
        )
      })
      .collect();

    // Workers now hold the only consumers of the job queue and the only
    // producers of the result queue.
    drop(jobs);
    drop(results);

    for (worker_id, outcome) in join_all(handles).await.into_iter().enumerate() {
      if let Err(join_error) = outcome {
        error!(pool_name = %*self.pool_name, worker_id, "Worker task failed to join: {:?}", join_error);
      }
    }

    self.mark_stopped();
    Ok(())
  }

  /// Runs the pool in the background.
  ///
  /// Waits up to the configured start grace window for the run to fail
  /// (for example because the pool was already started) and returns that
  /// error. After the window it returns `Ok(())` while the pool keeps running.
  pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
    let pool = Arc::clone(self);
    let mut handle = self.tokio_handle.spawn(
      async move { pool.run().await }.instrument(info_span!("worker_pool_run", pool_name = %*self.pool_name)),
    );

    match tokio::time::timeout(self.config.start_grace, &mut handle).await {
      Ok(Ok(outcome)) => outcome,
      Ok(Err(join_error)) => {
        error!(pool_name = %*self.pool_name, "Background run failed to join: {:?}", join_error);
        Err(PoolError::RunJoinError(join_error.to_string()))
      }
      Err(_elapsed) => {
        debug!(pool_name = %*self.pool_name, "No start error within grace window, pool running in background.");
        *self.run_join_handle.lock() = Some(handle);
        Ok(())
      }
    }
  }

  /// Closes the job queue. Idempotent, and a no-op unless the pool is running.
  ///
  /// Returns immediately. Buffered and in-flight jobs still complete; the
  /// result stream closes once the last worker exits.
  pub fn stop(&self) {
    match self.state.compare_exchange(
      PoolState::Running as u8,
      PoolState::Stopping as u8,
      AtomicOrdering::AcqRel,
      AtomicOrdering::Acquire,
    ) {
      Ok(_) => {
        let producer = self.job_producer.lock().take();
        drop(producer);
        info!(pool_name = %*self.pool_name, "Stop requested: job queue closed, workers draining.");
      }
      Err(current) => {
        trace!(pool_name = %*self.pool_name, state = ?PoolState::from(current), "Stop ignored, pool not running.");
      }
    }
  }

  /// Stops the pool and waits until every worker has exited.
  ///
  /// Returns immediately for a pool that was never run.
  pub async fn shutdown(&self) {
    self.stop();
    if self.state() == PoolState::Created {
      trace!(pool_name = %*self.pool_name, "Shutdown of a pool that never ran, nothing to wait for.");
      return;
    }

    let handle = self.run_join_handle.lock().take();
    if let Some(handle) = handle {
      match handle.await {
        Ok(Ok(())) => debug!(pool_name = %*self.pool_name, "Background run joined."),
        Ok(Err(e)) => warn!(pool_name = %*self.pool_name, "Background run ended with error: {}", e),
        Err(join_error) => error!(pool_name = %*self.pool_name, "Background run failed to join: {:?}", join_error),
      }
    }
    self.wait_stopped().await;
    info!(pool_name = %*self.pool_name, "Pool shutdown completed.");
  }

  /// Waits until the pool reaches [`PoolState::Stopped`].
  pub async fn wait_stopped(&self) {
    let mut stopped_rx = self.stopped_tx.subscribe();
    let _ = stopped_rx.wait_for(|stopped| *stopped).await;
  }

  /// Queues `job`, waiting while the queue is full. With a buffer size of 0
  /// this waits until a worker has taken the job.
  ///
  /// Jobs are accepted until the job queue is closed, including before the
  /// pool is run. Once this returns `Ok` on an unbuffered pool, the job is
  /// guaranteed a result even if the cancellation signal fires right after.
  ///
  /// # Errors
  /// `PoolError::PoolShuttingDown` if the pool is stopping or stopped, or the
  /// workers went away while this call was waiting.
  pub async fn add_job(&self, job: Job<A, T>) -> Result<(), PoolError> {
    let Some(producer) = self.open_job_producer() else {
      warn!(
        pool_name = %*self.pool_name,
        job_id = %job.descriptor().id(),
        state = ?self.state(),
        "AddJob: pool is not accepting jobs, job rejected."
      );
      return Err(PoolError::PoolShuttingDown);
    };

    let job_id = job.descriptor().id().to_string();
    trace!(pool_name = %*self.pool_name, %job_id, "Queueing job.");
    producer.send(job).await.map_err(|e| {
      warn!(pool_name = %*self.pool_name, %job_id, "AddJob: job queue closed while sending: {}", e);
      PoolError::PoolShuttingDown
    })
  }

  /// A handle on the result stream. Every call returns a handle on the same
  /// stream; it ends once the pool has stopped and all results are read.
  pub fn results(&self) -> ResultStream<T> {
    self.results.clone()
  }

  fn open_job_producer(&self) -> Option<QueueProducer<Job<A, T>>> {
    match self.state() {
      PoolState::Created | PoolState::Running => self.job_producer.lock().clone(),
      PoolState::Stopping | PoolState::Stopped => None,
    }
  }

  fn transition_to_running(&self) -> Result<(), PoolError> {
    match self.state.compare_exchange(
      PoolState::Created as u8,
      PoolState::Running as u8,
      AtomicOrdering::AcqRel,
      AtomicOrdering::Acquire,
    ) {
      Ok(_) => Ok(()),
      Err(current) => {
        let err = match PoolState::from(current) {
          PoolState::Created | PoolState::Running => PoolError::AlreadyRunning,
          PoolState::Stopping | PoolState::Stopped => PoolError::AlreadyStopped,
        };
        warn!(pool_name = %*self.pool_name, "Run rejected: {}", err);
        Err(err)
      }
    }
  }

  fn mark_stopped(&self) {
    self.state.store(PoolState::Stopped as u8, AtomicOrdering::Release);
    let producer = self.job_producer.lock().take();
    drop(producer);
    // No worker is left to take these; waiting senders get an error.
    let discarded = self.job_drain.close_and_discard();
    if discarded > 0 {
      debug!(pool_name = %*self.pool_name, discarded, "Discarded jobs left in the queue.");
    }
    self.stopped_tx.send_replace(true);
    info!(
      pool_name = %*self.pool_name,
      "Pool stopped. Jobs left in flight: {}",
      self.active_jobs.len()
    );
  }
}
