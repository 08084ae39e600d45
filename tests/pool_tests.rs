use job_pool::{
  CancelReason, CancelSignal, Descriptor, Job, JobError, JobResult, PoolConfig, PoolError, PoolState, WorkerPool,
  MAX_WORKERS,
};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Notify;
use tokio::time::sleep;

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,job_pool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn config(name: &str, worker_count: usize, buffer_size: usize) -> PoolConfig {
  PoolConfig::new(worker_count, buffer_size)
    .with_name(name)
    .with_start_grace(Duration::from_millis(20))
}

fn job_descriptor(id: &str) -> Descriptor {
  Descriptor::new(id).with_metadata("Name", "test")
}

// Sums its arguments after a short random delay so completion order varies.
fn sum_job(id: &str, args: Vec<i64>) -> Job<i64, i64> {
  Job::new(
    job_descriptor(id),
    |_cancel, args: Vec<i64>| async move {
      sleep(Duration::from_millis(rand::random::<u64>() % 5)).await;
      Ok::<i64, JobError>(args.iter().sum())
    },
    args,
  )
}

fn failing_job(id: &str) -> Job<i64, i64> {
  Job::new(
    job_descriptor(id),
    |_cancel, _args: Vec<i64>| async move { Err::<i64, JobError>(JobError::failed("failed")) },
    Vec::new(),
  )
}

fn checksum_job(id: &str, payload: Vec<u8>) -> Job<Vec<u8>, String> {
  Job::new(
    Descriptor::new(id).with_metadata("Created", SystemTime::now()),
    |_cancel, args: Vec<Vec<u8>>| async move {
      match args.first() {
        Some(data) => Ok(format!("{:x}", Sha256::digest(data))),
        None => Err(JobError::InvalidArgument("missing data".to_string())),
      }
    },
    vec![payload],
  )
}

/// Submits every job from a background task, then stops the pool.
fn submit_then_stop<A: Send + 'static, T: Send + 'static>(
  pool: &Arc<WorkerPool<A, T>>,
  jobs: Vec<Job<A, T>>,
) -> tokio::task::JoinHandle<()> {
  let pool = pool.clone();
  tokio::spawn(async move {
    for job in jobs {
      pool.add_job(job).await.expect("pool should accept jobs before stop");
    }
    pool.stop();
  })
}

async fn collect_results<A: Send + 'static, T: Send + 'static>(pool: &Arc<WorkerPool<A, T>>) -> Vec<JobResult<T>> {
  let results = pool.results();
  let mut collected = Vec::new();
  while let Some(result) = results.recv().await {
    collected.push(result);
  }
  collected
}

#[tokio::test]
async fn test_new_pool_validates_worker_count() {
  setup_tracing_for_test();

  let pool = WorkerPool::<i64, i64>::new(CancelSignal::new(), 0, 0, TokioHandle::current()).unwrap();
  assert_eq!(pool.worker_count(), num_cpus_or_one());
  assert_eq!(pool.state(), PoolState::Created);

  let max = WorkerPool::<i64, i64>::new(CancelSignal::new(), MAX_WORKERS, 0, TokioHandle::current());
  assert!(max.is_ok());

  let too_many = WorkerPool::<i64, i64>::new(CancelSignal::new(), MAX_WORKERS + 1, 0, TokioHandle::current());
  assert!(matches!(too_many, Err(PoolError::InvalidWorkerCount(n)) if n == MAX_WORKERS + 1));
}

fn num_cpus_or_one() -> usize {
  num_cpus::get().clamp(1, MAX_WORKERS)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_submitted_job_yields_one_result() {
  setup_tracing_for_test();

  for (name, worker_count, buffer_size) in [
    ("default", 0, 0),
    ("single_worker", 1, 0),
    ("buffered", 10, 10),
  ] {
    let pool = WorkerPool::from_config(config(name, worker_count, buffer_size), CancelSignal::new(), TokioHandle::current())
      .unwrap();
    pool.start().await.unwrap();

    let jobs: Vec<_> = (0..20i64)
      .map(|i| sum_job(&format!("{:03}", i + 1), vec![i + 1, i + 2]))
      .collect();
    let producer = submit_then_stop(&pool, jobs);

    let results = collect_results(&pool).await;
    producer.await.unwrap();

    assert_eq!(results.len(), 20, "pool {name}");
    let mut by_id: HashMap<String, Option<i64>> = HashMap::new();
    for result in results {
      assert!(result.error.is_none(), "pool {name}: unexpected error {:?}", result.error);
      by_id.insert(result.descriptor.id().to_string(), result.value);
    }
    for i in 0..20i64 {
      assert_eq!(by_id[&format!("{:03}", i + 1)], Some(2 * i + 3), "pool {name}");
    }

    pool.wait_stopped().await;
    assert_eq!(pool.state(), PoolState::Stopped);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checksums_with_unbuffered_queues() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("checksums", 4, 0), CancelSignal::new(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let payloads: HashMap<String, Vec<u8>> = (0..100)
    .map(|i| (format!("{:03}", i + 1), format!("job-{i}").into_bytes()))
    .collect();
  let jobs = payloads
    .iter()
    .map(|(id, payload)| checksum_job(id, payload.clone()))
    .collect();
  let producer = submit_then_stop(&pool, jobs);

  let results = collect_results(&pool).await;
  producer.await.unwrap();

  assert_eq!(results.len(), 100);
  for result in results {
    assert!(result.error.is_none());
    let expected = format!("{:x}", Sha256::digest(&payloads[result.descriptor.id()]));
    assert_eq!(result.value, Some(expected));
  }
}

#[tokio::test]
async fn test_single_worker_sums() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("sums", 1, 0), CancelSignal::new(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let producer = submit_then_stop(
    &pool,
    vec![sum_job("a", vec![1, 2]), sum_job("b", vec![10, -4]), sum_job("c", vec![])],
  );
  let results = collect_results(&pool).await;
  producer.await.unwrap();

  let by_id: HashMap<_, _> = results
    .into_iter()
    .map(|r| (r.descriptor.id().to_string(), r.value))
    .collect();
  assert_eq!(by_id["a"], Some(3));
  assert_eq!(by_id["b"], Some(6));
  assert_eq!(by_id["c"], Some(0));
}

#[tokio::test]
async fn test_deadline_before_any_job_yields_cancellation_result() {
  setup_tracing_for_test();
  let cancel = CancelSignal::with_timeout(Duration::from_millis(1));
  let pool = WorkerPool::<i64, i64>::from_config(config("deadline", 1, 0), cancel, TokioHandle::current()).unwrap();

  let runner = {
    let pool = pool.clone();
    tokio::spawn(async move { pool.run().await })
  };

  let results = pool.results();
  let result = results.recv().await.expect("cancellation result");
  assert_eq!(result.error, Some(JobError::Cancelled(CancelReason::DeadlineExceeded)));
  assert_eq!(result.value, None);
  assert_eq!(result.descriptor, Descriptor::default());
  assert!(result.is_cancellation());

  assert!(results.recv().await.is_none());
  assert_eq!(runner.await.unwrap(), Ok(()));
  assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_jobs_do_not_affect_others() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("failures", 4, 8), CancelSignal::new(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let mut jobs = Vec::new();
  for i in 0..10i64 {
    jobs.push(sum_job(&format!("sum-{i}"), vec![i, i]));
    jobs.push(failing_job(&format!("fail-{i}")));
  }
  let producer = submit_then_stop(&pool, jobs);
  let results = collect_results(&pool).await;
  producer.await.unwrap();

  assert_eq!(results.len(), 20);
  for result in results {
    let id = result.descriptor.id().to_string();
    if id.starts_with("fail-") {
      assert_eq!(result.value, None);
      assert_eq!(result.error, Some(JobError::failed("failed")));
    } else {
      let i: i64 = id.trim_start_matches("sum-").parse().unwrap();
      assert_eq!(result.into_result(), Ok(Some(2 * i)));
    }
  }
}

#[tokio::test]
async fn test_result_descriptor_matches_job_descriptor() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("descriptors", 2, 4), CancelSignal::new(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let descriptor = Descriptor::new("rich")
    .with_metadata("attempt", 3i64)
    .with_metadata("ratio", 0.5f64)
    .with_metadata("owner", "ops");
  let job = Job::new(
    descriptor.clone(),
    |_cancel, _args: Vec<()>| async move { Ok::<&'static str, JobError>("done") },
    Vec::new(),
  );
  pool.add_job(job).await.unwrap();
  pool.stop();

  let results = collect_results(&pool).await;
  assert_eq!(results.len(), 1);
  assert_eq!(results[0].descriptor, descriptor);
  assert_eq!(results[0].value, Some("done"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
  setup_tracing_for_test();
  let never_run = WorkerPool::<i64, i64>::from_config(config("never_run", 1, 0), CancelSignal::new(), TokioHandle::current())
    .unwrap();
  never_run.stop();
  never_run.stop();
  assert_eq!(never_run.state(), PoolState::Created);

  let pool = WorkerPool::<i64, i64>::from_config(config("stopped_twice", 2, 0), CancelSignal::new(), TokioHandle::current())
    .unwrap();
  pool.start().await.unwrap();
  pool.stop();
  pool.stop();
  pool.shutdown().await;
  pool.stop();
  assert_eq!(pool.state(), PoolState::Stopped);
  assert!(pool.results().recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stop_calls() {
  setup_tracing_for_test();
  let pool = WorkerPool::<i64, i64>::from_config(config("concurrent_stop", 4, 4), CancelSignal::new(), TokioHandle::current())
    .unwrap();
  pool.start().await.unwrap();

  let stoppers: Vec<_> = (0..8)
    .map(|_| {
      let pool = pool.clone();
      tokio::spawn(async move { pool.stop() })
    })
    .collect();
  for stopper in stoppers {
    stopper.await.unwrap();
  }

  pool.shutdown().await;
  assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test]
async fn test_buffered_jobs_drain_after_stop() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("drain", 1, 5), CancelSignal::new(), TokioHandle::current()).unwrap();

  // Jobs can be queued before the pool runs.
  for i in 0..5i64 {
    pool.add_job(sum_job(&i.to_string(), vec![i])).await.unwrap();
  }
  assert_eq!(pool.queued_job_count(), 5);

  pool.start().await.unwrap();
  pool.stop();
  assert_eq!(
    pool.add_job(sum_job("late", vec![1])).await,
    Err(PoolError::PoolShuttingDown)
  );

  let results = collect_results(&pool).await;
  assert_eq!(results.len(), 5);
  assert!(results.iter().all(JobResult::is_ok));
}

#[tokio::test]
async fn test_full_queue_applies_backpressure() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("backpressure", 1, 1), CancelSignal::new(), TokioHandle::current()).unwrap();

  pool.add_job(sum_job("first", vec![1])).await.unwrap();
  let blocked = tokio::time::timeout(Duration::from_millis(50), pool.add_job(sum_job("second", vec![2]))).await;
  assert!(blocked.is_err(), "add_job should wait while the queue is full");

  pool.start().await.unwrap();
  tokio::time::timeout(Duration::from_secs(1), pool.add_job(sum_job("third", vec![3])))
    .await
    .expect("queue should drain once workers run")
    .unwrap();
  pool.stop();

  let ids: Vec<String> = collect_results(&pool)
    .await
    .into_iter()
    .map(|r| r.descriptor.id().to_string())
    .collect();
  assert_eq!(ids, vec!["first".to_string(), "third".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_is_cooperative_for_running_jobs() {
  setup_tracing_for_test();
  let cancel = CancelSignal::new();
  let pool = WorkerPool::from_config(config("cooperative", 1, 4), cancel.clone(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let started = Arc::new(Notify::new());
  let job_started = started.clone();
  let slow: Job<(), &'static str> = Job::new(
    Descriptor::new("slow"),
    move |cancel: CancelSignal, _args| {
      let job_started = job_started.clone();
      async move {
        job_started.notify_one();
        for _ in 0..500 {
          if let Some(reason) = cancel.reason() {
            return Err(JobError::Cancelled(reason));
          }
          sleep(Duration::from_millis(10)).await;
        }
        Ok("finished")
      }
    },
    Vec::new(),
  );
  pool.add_job(slow).await.unwrap();
  started.notified().await;
  assert_eq!(pool.in_flight_count(), 1);
  assert_eq!(pool.in_flight()[0].id(), "slow");

  cancel.cancel();

  let results = collect_results(&pool).await;
  assert_eq!(results.len(), 2);
  assert_eq!(results[0].descriptor.id(), "slow");
  assert_eq!(results[0].error, Some(JobError::Cancelled(CancelReason::Cancelled)));
  assert!(results[1].descriptor.is_empty());
  assert!(results[1].is_cancellation());
  assert_eq!(pool.in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_accepted_job_survives_cancellation_right_after_add() {
  setup_tracing_for_test();

  for attempt in 0..20 {
    let cancel = CancelSignal::new();
    let pool = WorkerPool::from_config(config("handoff", 1, 0), cancel.clone(), TokioHandle::current()).unwrap();
    pool.start().await.unwrap();

    pool.add_job(sum_job("x", vec![1, 2])).await.unwrap();
    cancel.cancel();

    let results = collect_results(&pool).await;
    let accepted = results.iter().find(|r| r.descriptor.id() == "x");
    assert_eq!(accepted.map(|r| r.value), Some(Some(3)), "attempt {attempt}");
    assert!(results.iter().any(JobResult::is_cancellation), "attempt {attempt}");
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_accepted_job_has_result_when_cancelled_mid_submission() {
  setup_tracing_for_test();
  let cancel = CancelSignal::new();
  let pool = WorkerPool::from_config(config("racing", 3, 0), cancel.clone(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let submitters: Vec<_> = (0..4)
    .map(|producer| {
      let pool = pool.clone();
      tokio::spawn(async move {
        let mut accepted = Vec::new();
        for i in 0..50i64 {
          let id = format!("{producer}-{i}");
          match pool.add_job(sum_job(&id, vec![i])).await {
            Ok(()) => accepted.push(id),
            Err(e) => {
              assert_eq!(e, PoolError::PoolShuttingDown);
              break;
            }
          }
        }
        accepted
      })
    })
    .collect();

  let results = pool.results();
  let reader = tokio::spawn(async move {
    let mut ids = Vec::new();
    while let Some(result) = results.recv().await {
      ids.push(result.descriptor.id().to_string());
    }
    ids
  });

  sleep(Duration::from_millis(20)).await;
  cancel.cancel();

  let mut accepted = Vec::new();
  for submitter in submitters {
    accepted.extend(submitter.await.unwrap());
  }
  let reported = reader.await.unwrap();
  for id in &accepted {
    assert!(reported.contains(id), "accepted job {id} produced no result");
  }
}

#[tokio::test]
async fn test_panicking_job_is_reported() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("panics", 1, 4), CancelSignal::new(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let panicking: Job<i64, i64> = Job::new(
    Descriptor::new("panics"),
    |_cancel, args: Vec<i64>| async move {
      if args.is_empty() {
        panic!("Job intentionally panicked!");
      }
      Ok::<i64, JobError>(0)
    },
    Vec::new(),
  );
  pool.add_job(panicking).await.unwrap();
  pool.add_job(sum_job("after", vec![2, 2])).await.unwrap();
  pool.stop();

  let results = collect_results(&pool).await;
  assert_eq!(results.len(), 2);
  assert_eq!(results[0].error, Some(JobError::Panicked));
  assert_eq!(results[0].descriptor.id(), "panics");
  assert_eq!(results[1].value, Some(4));
}

#[tokio::test]
async fn test_results_as_stream() {
  setup_tracing_for_test();
  let pool = WorkerPool::from_config(config("stream", 2, 0), CancelSignal::new(), TokioHandle::current()).unwrap();
  pool.start().await.unwrap();

  let submitted = Arc::new(AtomicUsize::new(0));
  let jobs: Vec<_> = (0..6i64).map(|i| sum_job(&i.to_string(), vec![i])).collect();
  let producer = {
    let pool = pool.clone();
    let submitted = submitted.clone();
    tokio::spawn(async move {
      for job in jobs {
        pool.add_job(job).await.unwrap();
        submitted.fetch_add(1, Ordering::SeqCst);
      }
      pool.stop();
    })
  };

  let total: i64 = pool
    .results()
    .into_stream()
    .filter_map(|r| async move { r.value })
    .fold(0, |acc, v| async move { acc + v })
    .await;
  producer.await.unwrap();

  assert_eq!(submitted.load(Ordering::SeqCst), 6);
  assert_eq!(total, 15);
}

#[tokio::test]
async fn test_start_reports_run_error_within_grace_window() {
  setup_tracing_for_test();
  let pool = WorkerPool::<i64, i64>::from_config(config("restart", 1, 0), CancelSignal::new(), TokioHandle::current())
    .unwrap();
  pool.start().await.unwrap();
  assert_eq!(pool.start().await, Err(PoolError::AlreadyRunning));

  pool.shutdown().await;
  assert_eq!(pool.start().await, Err(PoolError::AlreadyStopped));
}
