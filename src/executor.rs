use crate::error::{OrchestraError, TaskError};
use crate::handle::{TaskHandle, TaskOutcome};
use crate::notifier::{CompletionNotifier, InternalCompletionMessage, TaskCompletionInfo, TaskCompletionStatus};
use crate::queue::{HighestFirst, PriorityComparator, QueuedTask, TaskQueue};
use crate::task::{ServiceInvoker, ServiceTask};

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fibre::mpsc::{self, UnboundedAsyncSender as AsyncSender};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Construction parameters of a pool.
///
/// The runtime handle decides where the pool's workers run; give each pool its own
/// runtime to isolate workloads at the thread level.
#[derive(Clone)]
pub struct PoolConfig {
  pub size: usize,
  pub runtime: TokioHandle,
  pub comparator: Arc<dyn PriorityComparator>,
}

impl fmt::Debug for PoolConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolConfig").field("size", &self.size).finish_non_exhaustive()
  }
}

impl PoolConfig {
  pub fn new(size: usize, runtime: TokioHandle) -> Self {
    Self {
      size,
      runtime,
      comparator: Arc::new(HighestFirst),
    }
  }

  pub fn with_comparator(mut self, comparator: impl PriorityComparator) -> Self {
    self.comparator = Arc::new(comparator);
    self
  }
}

/// A fixed-size worker pool fed by an unbounded priority queue.
///
/// A single dispatcher pulls the most urgent task whenever a worker slot (semaphore
/// permit) is free and runs it on the pool runtime.
pub struct PriorityExecutor {
  pool_name: Arc<String>,
  runtime: TokioHandle,
  queue: Arc<TaskQueue>,
  semaphore: Arc<Semaphore>,
  core_size: Mutex<usize>,
  active_task_info: Arc<DashMap<u64, ServiceTask>>,
  shutdown_token: CancellationToken,
  kill_token: CancellationToken,
  notifier: Arc<CompletionNotifier>,
  dispatcher_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PriorityExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PriorityExecutor")
      .field("pool_name", &self.pool_name)
      .field("core_size", &self.core_size())
      .field("active", &self.active_count())
      .field("queued", &self.queued_count())
      .field("shutdown", &self.is_shutdown())
      .finish()
  }
}

impl PriorityExecutor {
  pub fn new(pool_name: &str, config: PoolConfig, invoker: Arc<dyn ServiceInvoker>) -> Result<Arc<Self>, OrchestraError> {
    if config.size == 0 {
      return Err(OrchestraError::InvalidPoolSize(config.size));
    }

    let pool_name = Arc::new(pool_name.to_string());
    let (notify_tx, notify_rx) = mpsc::unbounded_async();
    let notifier = Arc::new(CompletionNotifier::new(notify_rx, config.runtime.clone(), pool_name.clone()));

    let executor = Arc::new(Self {
      pool_name: pool_name.clone(),
      runtime: config.runtime.clone(),
      queue: Arc::new(TaskQueue::new(config.comparator)),
      semaphore: Arc::new(Semaphore::new(config.size)),
      core_size: Mutex::new(config.size),
      active_task_info: Arc::new(DashMap::new()),
      shutdown_token: CancellationToken::new(),
      kill_token: CancellationToken::new(),
      notifier: notifier.clone(),
      dispatcher_join_handle: Mutex::new(None),
    });

    let dispatcher = Dispatcher {
      pool_name: pool_name.clone(),
      semaphore: executor.semaphore.clone(),
      queue: executor.queue.clone(),
      runtime: config.runtime.clone(),
      invoker,
      active_task_info: executor.active_task_info.clone(),
      shutdown_token: executor.shutdown_token.clone(),
      kill_token: executor.kill_token.clone(),
      notify_tx,
      notifier,
    };
    let join_handle = config
      .runtime
      .spawn(dispatcher.run().instrument(info_span!("priority_dispatch_loop", pool_name = %pool_name)));
    *executor.dispatcher_join_handle.lock() = Some(join_handle);

    info!(pool_name = %pool_name, size = config.size, "Priority executor created.");
    Ok(executor)
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub(crate) fn runtime(&self) -> &TokioHandle {
    &self.runtime
  }

  pub fn core_size(&self) -> usize {
    *self.core_size.lock()
  }

  /// Number of tasks currently executing.
  pub fn active_count(&self) -> usize {
    self.active_task_info.len()
  }

  /// Number of tasks waiting in the priority queue.
  pub fn queued_count(&self) -> usize {
    self.queue.len()
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// True once the dispatcher and every task it started have finished.
  pub fn is_terminated(&self) -> bool {
    self
      .dispatcher_join_handle
      .lock()
      .as_ref()
      .map_or(true, |join_handle| join_handle.is_finished())
  }

  /// Queues `task` and returns its handle. Never waits.
  ///
  /// `is_controller_entry` marks bookkeeping entries; they are scheduled exactly like
  /// service tasks.
  pub fn submit(&self, task: ServiceTask, is_controller_entry: bool) -> Result<TaskHandle, OrchestraError> {
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %self.pool_name, task_id = %task.id(), "Submit: Attempted to submit task to a pool that is shutting down.");
      return Err(OrchestraError::PoolShuttingDown(self.pool_name.to_string()));
    }

    let (handle, completer) = TaskHandle::pending(self.pool_name.clone(), self.runtime.clone(), is_controller_entry);
    handle.bind(task.clone());
    debug!(
      pool_name = %self.pool_name,
      task_id = %task.id(),
      handle_id = %handle.id(),
      service = %task.service(),
      priority = task.priority(),
      controller_entry = is_controller_entry,
      "Submitting task to priority queue."
    );
    self.queue.push(task, handle.clone(), completer);
    Ok(handle)
  }

  /// Changes the number of concurrently running tasks. Shrinking takes effect as
  /// running tasks release their slots.
  pub fn set_core_size(&self, new_size: usize) -> Result<(), OrchestraError> {
    if new_size == 0 {
      return Err(OrchestraError::InvalidPoolSize(new_size));
    }
    let mut core_size = self.core_size.lock();
    let old_size = *core_size;
    if new_size > old_size {
      self.semaphore.add_permits(new_size - old_size);
    } else if new_size < old_size {
      let surplus = (old_size - new_size) as u32;
      let semaphore = self.semaphore.clone();
      let pool_name = self.pool_name.clone();
      self.runtime.spawn(async move {
        match semaphore.acquire_many_owned(surplus).await {
          Ok(permits) => {
            permits.forget();
            debug!(pool_name = %pool_name, "Retired {} worker slots.", surplus);
          }
          Err(_) => trace!(pool_name = %pool_name, "Semaphore closed while retiring worker slots."),
        }
      });
    }
    *core_size = new_size;
    info!(pool_name = %self.pool_name, old_size, new_size, "Pool resized.");
    Ok(())
  }

  /// Stops accepting tasks. Queued and running tasks still complete.
  pub fn shutdown(&self) {
    if !self.shutdown_token.is_cancelled() {
      info!(pool_name = %self.pool_name, "Initiating graceful pool shutdown.");
      self.shutdown_token.cancel();
    } else {
      trace!(pool_name = %self.pool_name, "Shutdown already in progress.");
    }
  }

  /// Drops every queued task (their handles resolve as cancelled) and interrupts every
  /// running interruptable task. Non-interruptable tasks are left to finish.
  pub fn shutdown_now(&self) {
    info!(pool_name = %self.pool_name, "Forceful shutdown: cancelling queued and active tasks.");
    self.shutdown_token.cancel();
    self.kill_token.cancel();

    let active: Vec<ServiceTask> = self.active_task_info.iter().map(|entry| entry.value().clone()).collect();
    if active.is_empty() {
      info!(pool_name = %self.pool_name, "No active tasks to cancel forcefully.");
    }
    for task in active {
      debug!(pool_name = %self.pool_name, task_id = %task.id(), "Forcefully cancelling active task.");
      task.cancel();
    }
  }

  /// Waits up to `timeout` for the dispatcher and all started tasks to finish.
  ///
  /// Returns `Ok(false)` if the pool is still running when the budget expires.
  ///
  /// # Errors
  /// Returns `OrchestraError::ShutdownInterrupted` if the dispatcher was aborted or
  /// panicked while being awaited.
  pub async fn await_termination(&self, timeout: Duration) -> Result<bool, OrchestraError> {
    let join_handle = self.dispatcher_join_handle.lock().take();
    let Some(mut join_handle) = join_handle else {
      trace!(pool_name = %self.pool_name, "Dispatcher already joined.");
      return Ok(true);
    };

    match tokio::time::timeout(timeout, &mut join_handle).await {
      Ok(Ok(())) => {
        self.notifier.await_shutdown().await;
        info!(pool_name = %self.pool_name, "Pool terminated.");
        Ok(true)
      }
      Ok(Err(join_error)) => {
        error!(pool_name = %self.pool_name, "Error joining dispatcher during shutdown: {:?}", join_error);
        Err(OrchestraError::ShutdownInterrupted(format!("pool `{}`: {}", self.pool_name, join_error)))
      }
      Err(_) => {
        debug!(pool_name = %self.pool_name, ?timeout, "Pool did not terminate within the grace period.");
        *self.dispatcher_join_handle.lock() = Some(join_handle);
        Ok(false)
      }
    }
  }

  pub fn add_completion_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }
}

impl Drop for PriorityExecutor {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(pool_name = %*self.pool_name, "PriorityExecutor dropped. Initiating implicit graceful shutdown.");
      self.shutdown_token.cancel();
    }
  }
}

/// State owned by the dispatch loop. Holds no reference back to the executor so that
/// dropping the executor can trigger shutdown.
struct Dispatcher {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  queue: Arc<TaskQueue>,
  runtime: TokioHandle,
  invoker: Arc<dyn ServiceInvoker>,
  active_task_info: Arc<DashMap<u64, ServiceTask>>,
  shutdown_token: CancellationToken,
  kill_token: CancellationToken,
  notify_tx: AsyncSender<InternalCompletionMessage>,
  notifier: Arc<CompletionNotifier>,
}

impl Dispatcher {
  async fn run(self) {
    info!(pool_name = %*self.pool_name, "Dispatch loop started.");
    let tracker = TaskTracker::new();

    loop {
      tokio::select! {
        biased;

        _ = self.kill_token.cancelled() => {
          info!(pool_name = %*self.pool_name, "Kill signal received. Dispatch loop terminating.");
          break;
        }

        permit_result = self.semaphore.clone().acquire_owned() => {
          let permit = match permit_result {
            Ok(permit) => permit,
            Err(_) => {
              error!(pool_name = %*self.pool_name, "Semaphore closed. Dispatch loop exiting.");
              break;
            }
          };

          let next = tokio::select! {
            biased;
            _ = self.kill_token.cancelled() => None,
            entry = self.queue.next(&self.shutdown_token) => entry,
          };

          match next {
            Some(entry) => self.start(entry, permit, &tracker),
            None => {
              info!(pool_name = %*self.pool_name, "Queue closed and drained. Releasing permit.");
              break;
            }
          }
        }
      }
    }

    if self.kill_token.is_cancelled() {
      let dropped = self.queue.drain();
      if !dropped.is_empty() {
        info!(pool_name = %*self.pool_name, "Resolving {} queued tasks as cancelled.", dropped.len());
      }
      for entry in dropped {
        let (task, handle, completer) = entry.into_parts();
        task.mark_finished();
        let outcome: TaskOutcome = Err(TaskError::Cancelled);
        self.publish(&task, &handle, &outcome).await;
        completer.complete(outcome);
      }
    }

    tracker.close();
    tracker.wait().await;
    // Wakes any slot-retiring task still waiting on a shrink.
    self.semaphore.close();
    info!(
      pool_name = %*self.pool_name,
      "Dispatch loop stopped. Active tasks remaining: {}",
      self.active_task_info.len()
    );
  }

  fn start(&self, entry: QueuedTask, permit: OwnedSemaphorePermit, tracker: &TaskTracker) {
    let (task, handle, completer) = entry.into_parts();
    let task_id = task.id();

    if task.is_interrupted() {
      debug!(pool_name = %*self.pool_name, %task_id, "Dequeued task already cancelled.");
      drop(permit);
      let notifier = self.notifier.clone();
      let notify_tx = self.notify_tx.clone();
      let pool_name = self.pool_name.clone();
      tracker.spawn_on(
        async move {
          task.mark_finished();
          let outcome: TaskOutcome = Err(TaskError::Cancelled);
          publish_completion(&notifier, &notify_tx, &pool_name, &task, &handle, &outcome).await;
          completer.complete(outcome);
        },
        &self.runtime,
      );
      return;
    }

    self.active_task_info.insert(task_id, task.clone());
    debug!(pool_name = %*self.pool_name, %task_id, service = %task.service(), "Dequeued task. Spawning with permit.");

    let invoker = self.invoker.clone();
    let active_task_info = self.active_task_info.clone();
    let notifier = self.notifier.clone();
    let notify_tx = self.notify_tx.clone();
    let pool_name = self.pool_name.clone();
    let span = info_span!("service_task", pool_name = %*self.pool_name, %task_id, service = %task.service());

    tracker.spawn_on(
      async move {
        let _permit = permit;
        let outcome = execute(&invoker, &task).await;
        active_task_info.remove(&task_id);
        task.mark_finished();
        publish_completion(&notifier, &notify_tx, &pool_name, &task, &handle, &outcome).await;
        // Callbacks attached to the handle run here, on the worker.
        completer.complete(outcome);
        trace!(pool_name = %*pool_name, %task_id, "Task finished processing.");
      }
      .instrument(span),
      &self.runtime,
    );
  }

  async fn publish(&self, task: &ServiceTask, handle: &TaskHandle, outcome: &TaskOutcome) {
    publish_completion(&self.notifier, &self.notify_tx, &self.pool_name, task, handle, outcome).await;
  }
}

async fn execute(invoker: &Arc<dyn ServiceInvoker>, task: &ServiceTask) -> TaskOutcome {
  let invocation = {
    let invoker = invoker.clone();
    let request = task.request();
    let token = task.invocation_token();
    AssertUnwindSafe(async move { invoker.invoke(request, token).await }).catch_unwind()
  };

  let result = if task.is_interruptable() {
    tokio::select! {
      biased;
      _ = task.interrupt_token().cancelled() => {
        debug!(task_id = %task.id(), "Task execution interrupted by its token.");
        return Err(TaskError::Cancelled);
      }
      result = invocation => result,
    }
  } else {
    invocation.await
  };

  match result {
    Ok(Ok(record)) => {
      trace!(task_id = %task.id(), "Task executed successfully.");
      Ok(record)
    }
    Ok(Err(service_error)) => {
      debug!(task_id = %task.id(), service = %task.service(), "Service failed: {}", service_error);
      Err(TaskError::Service {
        service: task.service().to_string(),
        message: service_error.message,
      })
    }
    Err(_panic_payload) => {
      error!(task_id = %task.id(), service = %task.service(), "Task panicked during execution.");
      Err(TaskError::Panicked)
    }
  }
}

async fn publish_completion(
  notifier: &CompletionNotifier,
  notify_tx: &AsyncSender<InternalCompletionMessage>,
  pool_name: &Arc<String>,
  task: &ServiceTask,
  handle: &TaskHandle,
  outcome: &TaskOutcome,
) {
  if !notifier.is_active() {
    return;
  }
  let message = InternalCompletionMessage {
    task_id: task.id(),
    pool_name: pool_name.clone(),
    service: task.service().to_string(),
    status: TaskCompletionStatus::from(outcome),
    controller_entry: handle.is_controller_entry(),
  };
  if notify_tx.send(message).await.is_err() {
    trace!(pool_name = %**pool_name, task_id = %task.id(), "Completion queue closed, notification dropped.");
  }
}
