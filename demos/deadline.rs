use job_pool::{CancelSignal, Descriptor, Job, JobError, PoolConfig, WorkerPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

// Sleeps in small steps so the pool's deadline can interrupt it.
async fn slow_step_counter(cancel: CancelSignal, args: Vec<u64>) -> Result<u64, JobError> {
  let steps = args.first().copied().unwrap_or(0);
  for step in 0..steps {
    if let Some(reason) = cancel.reason() {
      info!("Stopping after {} of {} steps: {}", step, steps, reason);
      return Err(JobError::Cancelled(reason));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  Ok(steps)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Deadline Example ---");

  let cancel = CancelSignal::with_timeout(Duration::from_millis(400));
  let pool = WorkerPool::from_config(
    PoolConfig::new(2, 8).with_name("deadline_pool"),
    cancel,
    Handle::current(),
  )
  .expect("Failed to create a worker pool");

  for (i, steps) in [2u64, 4, 20, 30].into_iter().enumerate() {
    let job = Job::new(Descriptor::new(format!("job-{i}")), slow_step_counter, vec![steps]);
    pool.add_job(job).await.expect("Pool should accept jobs before it runs");
  }

  let runner = {
    let pool = pool.clone();
    tokio::spawn(async move { pool.run().await })
  };

  let results = pool.results();
  while let Some(result) = results.recv().await {
    if result.descriptor.is_empty() {
      info!("Worker exited: {:?}", result.error);
    } else {
      info!("{}: value={:?} error={:?}", result.descriptor.id(), result.value, result.error);
    }
  }

  runner.await.expect("Run task panicked").expect("Run failed");
  info!("Pool state: {:?}", pool.state());
  info!("--- Deadline Example End ---");
}
