use job_pool::{CancelSignal, Descriptor, Job, JobError, WorkerPool};
use sha2::{Digest, Sha256};
use std::time::SystemTime;
use tokio::runtime::Handle;
use tracing::{error, info};

async fn sha256_checksum(_cancel: CancelSignal, args: Vec<Vec<u8>>) -> Result<String, JobError> {
  match args.first() {
    Some(data) => Ok(format!("{:x}", Sha256::digest(data))),
    None => Err(JobError::InvalidArgument("missing data".to_string())),
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Checksum Example ---");

  let pool = WorkerPool::<Vec<u8>, String>::new(
    CancelSignal::new(),
    4, // Workers, 0 means one per CPU
    0, // Queue capacity, 0 hands every job over synchronously
    Handle::current(),
  )
  .expect("Failed to create a worker pool");

  if let Err(e) = pool.start().await {
    error!("Failed to start the worker pool: {}", e);
    return;
  }

  let num_jobs = 100;
  let producer = {
    let pool = pool.clone();
    tokio::spawn(async move {
      for i in 0..num_jobs {
        let job = Job::new(
          Descriptor::new(format!("{:03}", i + 1)).with_metadata("Created", SystemTime::now()),
          sha256_checksum,
          vec![format!("job-{i}").into_bytes()],
        );
        if let Err(e) = pool.add_job(job).await {
          error!("Failed to submit job {}: {}", i + 1, e);
        }
      }
      pool.stop();
    })
  };

  let results = pool.results();
  while let Some(result) = results.recv().await {
    match result.into_result() {
      Ok(Some(checksum)) => info!("job returned: {}", checksum),
      Ok(None) => info!("job returned nothing"),
      Err(e) => error!("job failed: {}", e),
    }
  }

  producer.await.expect("Producer task panicked");
  info!("--- Checksum Example End ---");
}
