//! A Tokio-based worker pool: submit descriptor-tagged jobs, a fixed group of
//! workers executes them concurrently, and one result per job comes back on a
//! shared result stream. Cancellation is cooperative and pool-wide.

mod cancel;
mod config;
mod error;
mod job;
mod pool;
mod queue;
mod worker;

pub use cancel::{CancelReason, CancelSignal};
pub use config::{PoolConfig, DEFAULT_START_GRACE, MAX_WORKERS};
pub use error::{JobError, PoolError};
pub use job::{Descriptor, Job, JobFn, JobFuture, JobResult, MetadataValue};
pub use pool::{PoolState, WorkerPool};
pub use queue::{BoundedQueue, QueueConsumer, QueueProducer, ResultStream};
pub use worker::{ActiveJobs, Worker};
