use thiserror::Error;

/// Infrastructure errors surfaced synchronously by registry, chain, group and wait
/// operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestraError {
  #[error("Thread pool `{0}` is not defined")]
  PoolNotFound(String),

  #[error("Timeout exception: deadline exceeded while waiting on task batch")]
  Timeout,

  #[error("Failfast: {0}")]
  Failfast(#[source] TaskError),

  #[error("Shutdown interruption: {0}")]
  ShutdownInterrupted(String),

  #[error("Thread pool `{0}` is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown(String),

  #[error("Invalid pool size {0}: a pool needs at least one worker")]
  InvalidPoolSize(usize),
}

/// Failure of a single task, observed through its [`TaskHandle`](crate::TaskHandle).
///
/// Cloneable so that every callback and waiter attached to a handle sees the same cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  #[error("Service `{service}` failed: {message}")]
  Service { service: String, message: String },

  #[error("Task was cancelled")]
  Cancelled,

  #[error("Submitted task panicked")]
  Panicked,

  #[error("Chained task rejected: pool `{pool}` is shutting down")]
  Rejected { pool: String },

  #[error("Task handle was abandoned before an outcome was produced")]
  Abandoned,
}

/// Failure reported by a [`ServiceInvoker`](crate::ServiceInvoker).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
  pub message: String,
}

impl ServiceError {
  pub fn new(message: impl Into<String>) -> Self {
    Self { message: message.into() }
  }
}
