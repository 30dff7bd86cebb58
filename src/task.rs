use crate::error::ServiceError;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

lazy_static::lazy_static! {
  static ref NEXT_SERVICE_TASK_ID: AtomicU64 = AtomicU64::new(0);
}

/// Structured key/value document exchanged with services.
pub type Record = serde_json::Map<String, Value>;

/// Session attached to tasks that were built without one.
pub const DEFAULT_SESSION: &str = "anonymous";

/// The business-logic collaborator that actually runs a named service.
///
/// Implementations of interruptable services should watch `cancellation`; the token
/// handed to non-interruptable invocations is never cancelled.
pub trait ServiceInvoker: Send + Sync + 'static {
  fn invoke(&self, request: ServiceRequest, cancellation: CancellationToken) -> BoxFuture<'static, Result<Record, ServiceError>>;
}

impl<F, Fut> ServiceInvoker for F
where
  F: Fn(ServiceRequest, CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Record, ServiceError>> + Send + 'static,
{
  fn invoke(&self, request: ServiceRequest, cancellation: CancellationToken) -> BoxFuture<'static, Result<Record, ServiceError>> {
    (self)(request, cancellation).boxed()
  }
}

/// What the invoker receives for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
  pub task_id: u64,
  pub service: String,
  pub input: Record,
  pub session: Arc<str>,
  pub priority: i32,
  pub interruptable: bool,
}

/// Plain description of a task before it is turned into a [`ServiceTask`].
///
/// Chain steps and error paths are described with the same type.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
  pub service: String,
  pub input: Record,
  pub priority: i32,
  pub interruptable: bool,
  pub session: Option<String>,
}

impl TaskSpec {
  pub fn new(service: impl Into<String>, input: Record) -> Self {
    Self {
      service: service.into(),
      input,
      priority: 0,
      interruptable: false,
      session: None,
    }
  }

  pub fn priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn interruptable(mut self, interruptable: bool) -> Self {
    self.interruptable = interruptable;
    self
  }

  pub fn session(mut self, session: impl Into<String>) -> Self {
    self.session = Some(session.into());
    self
  }
}

struct TaskInner {
  id: u64,
  service: String,
  input: Record,
  session: Arc<str>,
  priority: i32,
  interruptable: bool,
  token: CancellationToken,
  cancel_requested: AtomicBool,
  finished: AtomicBool,
}

/// An executable service invocation. Cloning shares the same underlying task.
#[derive(Clone)]
pub struct ServiceTask {
  inner: Arc<TaskInner>,
}

impl fmt::Debug for ServiceTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServiceTask")
      .field("id", &self.inner.id)
      .field("service", &self.inner.service)
      .field("session", &self.inner.session)
      .field("priority", &self.inner.priority)
      .field("interruptable", &self.inner.interruptable)
      .field("cancel_requested", &self.is_cancel_requested())
      .finish_non_exhaustive()
  }
}

impl From<TaskSpec> for ServiceTask {
  fn from(spec: TaskSpec) -> Self {
    ServiceTask::new(spec)
  }
}

impl ServiceTask {
  pub fn new(spec: TaskSpec) -> Self {
    let session: Arc<str> = Arc::from(spec.session.as_deref().unwrap_or(DEFAULT_SESSION));
    Self {
      inner: Arc::new(TaskInner {
        id: NEXT_SERVICE_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed),
        service: spec.service,
        input: spec.input,
        session,
        priority: spec.priority,
        interruptable: spec.interruptable,
        token: CancellationToken::new(),
        cancel_requested: AtomicBool::new(false),
        finished: AtomicBool::new(false),
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn service(&self) -> &str {
    &self.inner.service
  }

  pub fn input(&self) -> &Record {
    &self.inner.input
  }

  pub fn session(&self) -> &str {
    &self.inner.session
  }

  pub fn priority(&self) -> i32 {
    self.inner.priority
  }

  pub fn is_interruptable(&self) -> bool {
    self.inner.interruptable
  }

  /// Requests cancellation. Only interruptable tasks have their token triggered;
  /// the request is recorded either way.
  pub fn cancel(&self) {
    self.inner.cancel_requested.store(true, AtomicOrdering::SeqCst);
    if self.inner.interruptable {
      debug!(task_id = %self.inner.id, service = %self.inner.service, "ServiceTask: Interrupt requested.");
      self.inner.token.cancel();
    } else {
      debug!(task_id = %self.inner.id, service = %self.inner.service, "ServiceTask: Cancel requested on non-interruptable task, it will run to completion.");
    }
  }

  pub fn is_cancel_requested(&self) -> bool {
    self.inner.cancel_requested.load(AtomicOrdering::SeqCst)
  }

  /// True once a worker has produced an outcome for this task.
  pub fn is_finished(&self) -> bool {
    self.inner.finished.load(AtomicOrdering::SeqCst)
  }

  pub(crate) fn mark_finished(&self) {
    self.inner.finished.store(true, AtomicOrdering::SeqCst);
  }

  /// Token delivered to the invoker. Non-interruptable tasks get a detached token.
  pub(crate) fn invocation_token(&self) -> CancellationToken {
    if self.inner.interruptable {
      self.inner.token.clone()
    } else {
      CancellationToken::new()
    }
  }

  pub(crate) fn is_interrupted(&self) -> bool {
    self.inner.token.is_cancelled()
  }

  pub(crate) fn interrupt_token(&self) -> &CancellationToken {
    &self.inner.token
  }

  pub(crate) fn request(&self) -> ServiceRequest {
    ServiceRequest {
      task_id: self.inner.id,
      service: self.inner.service.clone(),
      input: self.inner.input.clone(),
      session: self.inner.session.clone(),
      priority: self.inner.priority,
      interruptable: self.inner.interruptable,
    }
  }
}

/// Layers `upstream` onto `input`. Top-level keys of `upstream` win on collision.
pub fn merge_records(input: &Record, upstream: &Record) -> Record {
  let mut merged = input.clone();
  for (key, value) in upstream {
    merged.insert(key.clone(), value.clone());
  }
  merged
}
