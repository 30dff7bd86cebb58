use crate::error::{OrchestraError, TaskError};
use crate::task::{Record, ServiceTask};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);
}

/// Eventual result of a task: the service output record or the failure cause.
pub type TaskOutcome = Result<Record, TaskError>;

type CompletionCallback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

enum CompletionState {
  Pending(Vec<CompletionCallback>),
  Done(TaskOutcome),
}

struct Binding {
  task: Option<ServiceTask>,
  cancel_requested: bool,
}

/// Shared slot a worker writes into and any number of handles read from.
pub(crate) struct Completion {
  handle_id: u64,
  state: Mutex<CompletionState>,
  done_tx: watch::Sender<bool>,
  binding: Mutex<Binding>,
  runtime: TokioHandle,
}

impl Completion {
  fn complete(&self, outcome: TaskOutcome) -> bool {
    let callbacks = {
      let mut state = self.state.lock();
      if let CompletionState::Done(_) = &*state {
        return false;
      }
      match std::mem::replace(&mut *state, CompletionState::Done(outcome.clone())) {
        CompletionState::Pending(callbacks) => callbacks,
        CompletionState::Done(_) => Vec::new(),
      }
    };
    self.done_tx.send_replace(true);

    trace!(handle_id = %self.handle_id, "Handle completed. Running {} callbacks.", callbacks.len());
    for callback in callbacks {
      run_callback(self.handle_id, callback, outcome.clone());
    }
    true
  }

  fn add_callback(&self, callback: CompletionCallback) {
    let outcome = {
      let mut state = self.state.lock();
      match &mut *state {
        CompletionState::Pending(callbacks) => {
          callbacks.push(callback);
          return;
        }
        CompletionState::Done(outcome) => outcome.clone(),
      }
    };
    // Already resolved: run on the pool runtime rather than on the registering caller.
    let handle_id = self.handle_id;
    self.runtime.spawn(async move {
      run_callback(handle_id, callback, outcome);
    });
  }

  fn current(&self) -> Option<TaskOutcome> {
    match &*self.state.lock() {
      CompletionState::Pending(_) => None,
      CompletionState::Done(outcome) => Some(outcome.clone()),
    }
  }
}

fn run_callback(handle_id: u64, callback: CompletionCallback, outcome: TaskOutcome) {
  let result = std::panic::catch_unwind(AssertUnwindSafe(move || callback(outcome)));
  if result.is_err() {
    error!(%handle_id, "A completion callback panicked during execution.");
  }
}

/// Producer side of a handle. Resolves the handle with [`TaskError::Abandoned`] if it is
/// dropped before [`Completer::complete`] is called.
pub(crate) struct Completer {
  completion: Option<Arc<Completion>>,
}

impl Completer {
  pub(crate) fn complete(mut self, outcome: TaskOutcome) {
    if let Some(completion) = self.completion.take() {
      if !completion.complete(outcome) {
        debug!(handle_id = %completion.handle_id, "Completer: Handle was already resolved, outcome dropped.");
      }
    }
  }
}

impl Drop for Completer {
  fn drop(&mut self) {
    if let Some(completion) = self.completion.take() {
      warn!(handle_id = %completion.handle_id, "Completer dropped without an outcome. Resolving handle as abandoned.");
      completion.complete(Err(TaskError::Abandoned));
    }
  }
}

impl fmt::Debug for Completer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Completer")
      .field("handle_id", &self.completion.as_ref().map(|c| c.handle_id))
      .finish()
  }
}

/// A cloneable handle to the eventual outcome of a task.
///
/// Supports waiting (with or without a timeout), callback registration and
/// cancellation. Callbacks run on the pool's runtime, never inline on the thread that
/// registered them.
#[derive(Clone)]
pub struct TaskHandle {
  id: u64,
  pool_name: Arc<String>,
  controller_entry: bool,
  completion: Arc<Completion>,
}

impl fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("id", &self.id)
      .field("pool_name", &self.pool_name)
      .field("controller_entry", &self.controller_entry)
      .field("done", &self.is_done())
      .finish()
  }
}

impl TaskHandle {
  pub(crate) fn pending(pool_name: Arc<String>, runtime: TokioHandle, controller_entry: bool) -> (TaskHandle, Completer) {
    let id = NEXT_HANDLE_ID.fetch_add(1, AtomicOrdering::Relaxed);
    let (done_tx, _) = watch::channel(false);
    let completion = Arc::new(Completion {
      handle_id: id,
      state: Mutex::new(CompletionState::Pending(Vec::new())),
      done_tx,
      binding: Mutex::new(Binding {
        task: None,
        cancel_requested: false,
      }),
      runtime,
    });
    let handle = TaskHandle {
      id,
      pool_name,
      controller_entry,
      completion: completion.clone(),
    };
    (handle, Completer { completion: Some(completion) })
  }

  /// Attaches the task whose outcome this handle reports. A cancel requested before the
  /// task was known is delivered now.
  pub(crate) fn bind(&self, task: ServiceTask) {
    let mut binding = self.completion.binding.lock();
    if binding.cancel_requested {
      task.cancel();
    }
    binding.task = Some(task);
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn pool_name(&self) -> &str {
    &self.pool_name
  }

  /// Whether this handle was submitted as a bookkeeping (controller) entry.
  pub fn is_controller_entry(&self) -> bool {
    self.controller_entry
  }

  /// The task currently backing this handle. `None` for a chained handle whose
  /// downstream task has not been submitted yet.
  pub fn task(&self) -> Option<ServiceTask> {
    self.completion.binding.lock().task.clone()
  }

  /// Requests cancellation of the underlying task. For chained handles the request is
  /// remembered and applied once the downstream task exists.
  pub fn cancel(&self) {
    let mut binding = self.completion.binding.lock();
    binding.cancel_requested = true;
    match &binding.task {
      Some(task) => task.cancel(),
      None => debug!(handle_id = %self.id, "TaskHandle: Cancel recorded, no task bound yet."),
    }
  }

  pub fn is_cancellation_requested(&self) -> bool {
    self.completion.binding.lock().cancel_requested
  }

  pub fn is_done(&self) -> bool {
    *self.completion.done_tx.borrow()
  }

  /// Returns the outcome if already available.
  pub fn try_outcome(&self) -> Option<TaskOutcome> {
    self.completion.current()
  }

  /// Waits for the task to resolve.
  pub async fn outcome(&self) -> TaskOutcome {
    let mut done_rx = self.completion.done_tx.subscribe();
    // The sender lives in `completion`, which this handle keeps alive.
    let _ = done_rx.wait_for(|done| *done).await;
    self.completion.current().unwrap_or(Err(TaskError::Abandoned))
  }

  /// Waits for the task to resolve for at most `timeout`.
  ///
  /// # Errors
  /// Returns `OrchestraError::Timeout` if the outcome is not available in time. The
  /// task itself is left untouched.
  pub async fn outcome_timeout(&self, timeout: Duration) -> Result<TaskOutcome, OrchestraError> {
    tokio::time::timeout(timeout, self.outcome())
      .await
      .map_err(|_| OrchestraError::Timeout)
  }

  /// Registers a callback run once with the outcome.
  pub fn on_complete(&self, callback: impl FnOnce(TaskOutcome) + Send + 'static) {
    self.completion.add_callback(Box::new(callback));
  }

  /// Registers a callback run only if the task succeeds.
  pub fn on_success(&self, callback: impl FnOnce(Record) + Send + 'static) {
    self.on_complete(move |outcome| {
      if let Ok(record) = outcome {
        callback(record);
      }
    });
  }

  /// Registers a callback run only if the task fails.
  pub fn on_failure(&self, callback: impl FnOnce(TaskError) + Send + 'static) {
    self.on_complete(move |outcome| {
      if let Err(cause) = outcome {
        callback(cause);
      }
    });
  }
}
