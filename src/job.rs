use crate::cancel::CancelSignal;
use crate::error::JobError;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

/// The future an operation returns.
pub type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send + 'static>>;

/// A shared job operation: receives the pool's cancellation signal and the
/// job's arguments.
pub type JobFn<A, T> = Arc<dyn Fn(CancelSignal, Vec<A>) -> JobFuture<T> + Send + Sync + 'static>;

/// A value stored in a descriptor's metadata table.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
  String(String),
  Int(i64),
  Float(f64),
  Bool(bool),
  Time(SystemTime),
}

impl From<&str> for MetadataValue {
  fn from(value: &str) -> Self {
    MetadataValue::String(value.to_string())
  }
}

impl From<String> for MetadataValue {
  fn from(value: String) -> Self {
    MetadataValue::String(value)
  }
}

impl From<i64> for MetadataValue {
  fn from(value: i64) -> Self {
    MetadataValue::Int(value)
  }
}

impl From<f64> for MetadataValue {
  fn from(value: f64) -> Self {
    MetadataValue::Float(value)
  }
}

impl From<bool> for MetadataValue {
  fn from(value: bool) -> Self {
    MetadataValue::Bool(value)
  }
}

impl From<SystemTime> for MetadataValue {
  fn from(value: SystemTime) -> Self {
    MetadataValue::Time(value)
  }
}

/// Identity tag attached to a job and echoed back on its result.
///
/// The pool never looks inside it. The default descriptor (empty id, no
/// metadata) marks results the worker produced on its own, such as a
/// cancellation notice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
  id: String,
  metadata: HashMap<String, MetadataValue>,
}

impl Descriptor {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      metadata: HashMap::new(),
    }
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn metadata(&self) -> &HashMap<String, MetadataValue> {
    &self.metadata
  }

  pub fn get(&self, key: &str) -> Option<&MetadataValue> {
    self.metadata.get(key)
  }

  pub fn is_empty(&self) -> bool {
    self.id.is_empty() && self.metadata.is_empty()
  }
}

/// A unit of work: a descriptor, an operation and the arguments to call it with.
pub struct Job<A, T> {
  descriptor: Descriptor,
  operation: Option<JobFn<A, T>>,
  args: Vec<A>,
}

impl<A, T> Job<A, T>
where
  A: Send + 'static,
  T: Send + 'static,
{
  pub fn new<F, Fut>(descriptor: Descriptor, operation: F, args: Vec<A>) -> Self
  where
    F: Fn(CancelSignal, Vec<A>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, JobError>> + Send + 'static,
  {
    let operation: JobFn<A, T> = Arc::new(move |cancel, args| Box::pin(operation(cancel, args)));
    Self {
      descriptor,
      operation: Some(operation),
      args,
    }
  }

  /// Builds a job around an operation that is already shared.
  pub fn from_shared(descriptor: Descriptor, operation: JobFn<A, T>, args: Vec<A>) -> Self {
    Self {
      descriptor,
      operation: Some(operation),
      args,
    }
  }

  /// A job with nothing to run. Executing it yields a result with neither a
  /// value nor an error.
  pub fn without_operation(descriptor: Descriptor, args: Vec<A>) -> Self {
    Self {
      descriptor,
      operation: None,
      args,
    }
  }

  pub fn descriptor(&self) -> &Descriptor {
    &self.descriptor
  }

  pub fn args(&self) -> &[A] {
    &self.args
  }

  pub fn has_operation(&self) -> bool {
    self.operation.is_some()
  }

  /// Runs the operation with `cancel` and the stored arguments.
  pub async fn exec(self, cancel: &CancelSignal) -> JobResult<T> {
    let Job {
      descriptor,
      operation,
      args,
    } = self;
    let Some(operation) = operation else {
      return JobResult {
        descriptor,
        value: None,
        error: None,
      };
    };
    match operation(cancel.clone(), args).await {
      Ok(value) => JobResult::success(descriptor, value),
      Err(error) => JobResult::failure(descriptor, error),
    }
  }
}

impl<A: Clone, T> Clone for Job<A, T> {
  fn clone(&self) -> Self {
    Self {
      descriptor: self.descriptor.clone(),
      operation: self.operation.clone(),
      args: self.args.clone(),
    }
  }
}

impl<A, T> fmt::Debug for Job<A, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("descriptor", &self.descriptor)
      .field("has_operation", &self.operation.is_some())
      .field("arg_count", &self.args.len())
      .finish()
  }
}

/// The outcome of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult<T> {
  pub descriptor: Descriptor,
  pub value: Option<T>,
  pub error: Option<JobError>,
}

impl<T> JobResult<T> {
  pub fn success(descriptor: Descriptor, value: T) -> Self {
    Self {
      descriptor,
      value: Some(value),
      error: None,
    }
  }

  pub fn failure(descriptor: Descriptor, error: JobError) -> Self {
    Self {
      descriptor,
      value: None,
      error: Some(error),
    }
  }

  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }

  /// True for results a worker emitted because the pool's signal fired.
  pub fn is_cancellation(&self) -> bool {
    self.error.as_ref().is_some_and(JobError::is_cancellation)
  }

  pub fn into_result(self) -> Result<Option<T>, JobError> {
    match self.error {
      Some(error) => Err(error),
      None => Ok(self.value),
    }
  }
}
