use crate::error::TaskError;
use crate::handle::TaskOutcome;

use fibre::mpsc::{RecvError, UnboundedAsyncReceiver as AsyncReceiver};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Once};
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

/// How a task finished, as reported to completion handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Success,
  Failed,
  Cancelled,
  Panicked,
}

impl From<&TaskOutcome> for TaskCompletionStatus {
  fn from(outcome: &TaskOutcome) -> Self {
    match outcome {
      Ok(_) => TaskCompletionStatus::Success,
      Err(TaskError::Cancelled) => TaskCompletionStatus::Cancelled,
      Err(TaskError::Panicked) => TaskCompletionStatus::Panicked,
      Err(_) => TaskCompletionStatus::Failed,
    }
  }
}

/// Delivered to every completion handler of a pool once per finished task.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub task_id: u64,
  pub pool_name: Arc<String>,
  pub service: String,
  pub status: TaskCompletionStatus,
  pub controller_entry: bool,
  pub completion_time: SystemTime,
}

#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) task_id: u64,
  pub(crate) pool_name: Arc<String>,
  pub(crate) service: String,
  pub(crate) status: TaskCompletionStatus,
  pub(crate) controller_entry: bool,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

struct NotifierState {
  rx_for_init: Option<AsyncReceiver<InternalCompletionMessage>>,
  runtime: TokioHandle,
  pool_name: Arc<String>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Fans task completions of one pool out to registered handlers.
///
/// The delivery worker is started lazily by the first handler registration; until then
/// the executor does not publish anything.
pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  active: AtomicBool,
  init_once: Once,
  state: Mutex<NotifierState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &self.handlers.read().len())
      .field("initialized", &self.init_once.is_completed())
      .finish()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(rx: AsyncReceiver<InternalCompletionMessage>, runtime: TokioHandle, pool_name: Arc<String>) -> Self {
    Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      active: AtomicBool::new(false),
      init_once: Once::new(),
      state: Mutex::new(NotifierState {
        rx_for_init: Some(rx),
        runtime,
        pool_name,
        worker_join_handle: None,
      }),
    }
  }

  /// True once at least one handler is registered.
  pub(crate) fn is_active(&self) -> bool {
    self.active.load(AtomicOrdering::Acquire)
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();
    let count = {
      let mut handlers = self.handlers.write();
      handlers.push(Arc::new(handler));
      handlers.len()
    };
    self.active.store(true, AtomicOrdering::Release);
    info!(pool_name = %*self.state.lock().pool_name, "Notifier: Added completion handler. Total handlers: {}", count);
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state = self.state.lock();
      if let Some(rx) = state.rx_for_init.take() {
        info!(pool_name = %*state.pool_name, "First completion handler added. Starting notification worker.");
        let worker = Self::run_notification_worker_loop(rx, self.handlers.clone(), state.runtime.clone())
          .instrument(info_span!("notification_worker_loop", pool_name = %*state.pool_name));
        state.worker_join_handle = Some(state.runtime.spawn(worker));
      }
    });
  }

  async fn run_notification_worker_loop(
    mut queue_rx: AsyncReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    runtime: TokioHandle,
  ) {
    info!("Notification worker started.");
    loop {
      let message = match queue_rx.recv().await {
        Ok(message) => message,
        Err(RecvError::Disconnected) => {
          info!("Notification worker: Completion queue closed. Terminating.");
          break;
        }
      };

      let info = TaskCompletionInfo {
        task_id: message.task_id,
        pool_name: message.pool_name,
        service: message.service,
        status: message.status,
        controller_entry: message.controller_entry,
        completion_time: SystemTime::now(),
      };

      let handlers_snapshot: Vec<CompletionHandler> = handlers.read().clone();
      debug!(task_id = %info.task_id, "Dispatching notification to {} handlers.", handlers_snapshot.len());
      for handler in handlers_snapshot {
        let info = info.clone();
        runtime.spawn(async move {
          let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(info.clone())));
          if result.is_err() {
            error!(pool_name = %info.pool_name, task_id = %info.task_id, "A completion handler panicked during execution.");
          }
        });
      }
    }
  }

  pub(crate) async fn await_shutdown(&self) {
    let (join_handle, pool_name) = {
      let mut state = self.state.lock();
      (state.worker_join_handle.take(), state.pool_name.clone())
    };

    match join_handle {
      Some(join_handle) => {
        if let Err(e) = join_handle.await {
          error!(pool_name = %*pool_name, "Notifier: Error joining notification worker: {:?}", e);
        } else {
          debug!(pool_name = %*pool_name, "Notifier: Notification worker joined.");
        }
      }
      None => trace!(pool_name = %*pool_name, "Notifier: Worker never started or already joined."),
    }
  }
}
