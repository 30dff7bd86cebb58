use crate::controller::ControllerRegistry;
use crate::error::OrchestraError;
use crate::executor::{PoolConfig, PriorityExecutor};
use crate::handle::TaskHandle;
use crate::notifier::TaskCompletionInfo;
use crate::task::{ServiceInvoker, ServiceTask};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

/// Grace period granted to each pool by [`PoolRegistry::shutdown_all`].
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// Point-in-time figures for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
  pub core_pool_size: usize,
  pub active_count: usize,
  pub queued: usize,
}

/// Named pools and the controller groups spanning them.
///
/// Construct one at startup, share it by reference (or `Arc`), and call
/// [`shutdown_all`](Self::shutdown_all) on the way out.
#[derive(Debug)]
pub struct PoolRegistry {
  pools: DashMap<String, Arc<PriorityExecutor>>,
  pub(crate) controllers: ControllerRegistry,
  shutdown_grace: Duration,
}

impl Default for PoolRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl PoolRegistry {
  pub fn new() -> Self {
    Self::with_shutdown_grace(DEFAULT_SHUTDOWN_GRACE)
  }

  pub fn with_shutdown_grace(shutdown_grace: Duration) -> Self {
    Self {
      pools: DashMap::new(),
      controllers: ControllerRegistry::default(),
      shutdown_grace,
    }
  }

  /// Registers a pool under `name`. A second call for an existing name does nothing;
  /// the first configuration wins.
  pub fn create_pool(&self, name: &str, config: PoolConfig, invoker: Arc<dyn ServiceInvoker>) -> Result<(), OrchestraError> {
    match self.pools.entry(name.to_string()) {
      Entry::Occupied(_) => {
        debug!(pool_name = %name, "Pool already registered. Ignoring create.");
        Ok(())
      }
      Entry::Vacant(vacant) => {
        let executor = PriorityExecutor::new(name, config, invoker)?;
        vacant.insert(executor);
        Ok(())
      }
    }
  }

  pub fn is_pool_registered(&self, name: &str) -> bool {
    self.pools.contains_key(name)
  }

  pub fn pool_names(&self) -> Vec<String> {
    self.pools.iter().map(|entry| entry.key().clone()).collect()
  }

  /// Looks up the executor behind `name`.
  pub fn executor(&self, name: &str) -> Result<Arc<PriorityExecutor>, OrchestraError> {
    self
      .pools
      .get(name)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| OrchestraError::PoolNotFound(name.to_string()))
  }

  pub fn submit(&self, pool: &str, task: impl Into<ServiceTask>) -> Result<TaskHandle, OrchestraError> {
    self.executor(pool)?.submit(task.into(), false)
  }

  /// Submits a bookkeeping entry. Scheduled like any other task; the handle reports
  /// [`TaskHandle::is_controller_entry`].
  pub fn submit_controller(&self, pool: &str, task: impl Into<ServiceTask>) -> Result<TaskHandle, OrchestraError> {
    self.executor(pool)?.submit(task.into(), true)
  }

  pub fn resize_pool(&self, name: &str, new_size: usize) -> Result<(), OrchestraError> {
    self.executor(name)?.set_core_size(new_size)
  }

  pub fn add_completion_handler(
    &self,
    pool: &str,
    handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static,
  ) -> Result<(), OrchestraError> {
    self.executor(pool)?.add_completion_handler(handler);
    Ok(())
  }

  /// Shuts `name` down: no new tasks, queued and running tasks get up to `timeout` to
  /// finish, then running interruptable tasks are interrupted and the rest of the
  /// queue is dropped.
  ///
  /// The pool is unregistered on every path, including when this future is dropped
  /// mid-wait.
  ///
  /// # Errors
  /// `PoolNotFound` for an unknown name, `ShutdownInterrupted` if awaiting termination
  /// itself failed.
  pub async fn close_pool(&self, name: &str, timeout: Duration) -> Result<(), OrchestraError> {
    let executor = self.executor(name)?;
    let _unregister = Unregister {
      pools: &self.pools,
      name,
      executor: &executor,
    };

    executor.shutdown();
    match executor.await_termination(timeout).await? {
      true => info!(pool_name = %name, "Pool closed gracefully."),
      false => {
        warn!(pool_name = %name, ?timeout, "Pool did not terminate in time. Forcing shutdown.");
        executor.shutdown_now();
      }
    }
    Ok(())
  }

  /// Closes every pool one after the other with the registry's grace period. Failures
  /// are logged and do not stop the remaining closes.
  pub async fn shutdown_all(&self) {
    let names = self.pool_names();
    info!(pools = names.len(), grace = ?self.shutdown_grace, "Shutting down all pools.");
    for name in names {
      if let Err(e) = self.close_pool(&name, self.shutdown_grace).await {
        error!(pool_name = %name, "Shutdown exception: {}", e);
      }
    }
  }

  pub fn pool_stats(&self, name: &str) -> Result<PoolStats, OrchestraError> {
    Ok(stats_of(&*self.executor(name)?))
  }

  /// Typed snapshot of every pool, ordered by name.
  pub fn snapshot(&self) -> BTreeMap<String, PoolStats> {
    self
      .pools
      .iter()
      .map(|entry| (entry.key().clone(), stats_of(entry.value())))
      .collect()
  }

  /// Snapshot rendered as `{ "<pool>": { "corePoolSize": n, "activeCount": m, "queued": q } }`.
  ///
  /// Consistent per pool, not across pools.
  pub fn introspect(&self) -> Value {
    serde_json::to_value(self.snapshot()).unwrap_or_else(|e| {
      error!("Failed to render pool snapshot: {}", e);
      Value::Object(Map::new())
    })
  }
}

fn stats_of(executor: &PriorityExecutor) -> PoolStats {
  PoolStats {
    core_pool_size: executor.core_size(),
    active_count: executor.active_count(),
    queued: executor.queued_count(),
  }
}

/// Removes the pool entry when dropped, provided it still maps to the same executor.
struct Unregister<'a> {
  pools: &'a DashMap<String, Arc<PriorityExecutor>>,
  name: &'a str,
  executor: &'a Arc<PriorityExecutor>,
}

impl Drop for Unregister<'_> {
  fn drop(&mut self) {
    let removed = self
      .pools
      .remove_if(self.name, |_, registered| Arc::ptr_eq(registered, self.executor));
    if removed.is_some() {
      debug!(pool_name = %self.name, "Pool unregistered.");
    }
  }
}
