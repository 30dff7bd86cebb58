use crate::error::{OrchestraError, TaskError};
use crate::handle::TaskHandle;
use crate::registry::PoolRegistry;
use crate::task::ServiceTask;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Sibling tasks sharing a "first failure cancels the rest" policy.
#[derive(Debug)]
pub struct ControllerGroup {
  id: String,
  pool_name: String,
  tasks: Vec<ServiceTask>,
  handle_ids: Vec<u64>,
}

impl ControllerGroup {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn pool_name(&self) -> &str {
    &self.pool_name
  }

  pub fn tasks(&self) -> &[ServiceTask] {
    &self.tasks
  }

  pub fn handle_ids(&self) -> &[u64] {
    &self.handle_ids
  }

  /// Members that have not produced an outcome yet.
  pub fn pending_count(&self) -> usize {
    self.tasks.iter().filter(|task| !task.is_finished()).count()
  }

  /// Cancels every unfinished member except `failed_task_id`. Returns how many were
  /// asked to cancel.
  fn cancel_others(&self, failed_task_id: Option<u64>) -> usize {
    let mut cancelled = 0;
    for task in &self.tasks {
      if Some(task.id()) == failed_task_id || task.is_finished() {
        continue;
      }
      trace!(controller_id = %self.id, task_id = %task.id(), "Cancelling sibling task.");
      task.cancel();
      cancelled += 1;
    }
    cancelled
  }

  /// Cancels every unfinished member.
  pub fn cancel_all(&self) -> usize {
    self.cancel_others(None)
  }
}

/// Index of live controller groups by id.
///
/// Holds weak references only: a group lives as long as the failure callbacks of its
/// still-pending members.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
  groups: DashMap<String, Weak<ControllerGroup>>,
}

impl ControllerRegistry {
  fn register(&self, group: &Arc<ControllerGroup>) {
    self.purge();
    self.groups.insert(group.id.clone(), Arc::downgrade(group));
  }

  pub fn get(&self, id: &str) -> Option<Arc<ControllerGroup>> {
    self.groups.get(id).and_then(|entry| entry.value().upgrade())
  }

  /// Drops entries whose group has been reclaimed.
  pub fn purge(&self) {
    self.groups.retain(|_, group| group.strong_count() > 0);
  }

  pub fn live_count(&self) -> usize {
    self.groups.iter().filter(|entry| entry.value().strong_count() > 0).count()
  }
}

impl PoolRegistry {
  /// Groups `futures`/`tasks` under a fresh controller id. When any of `futures` fails,
  /// every other still-pending task in `tasks` is cancelled.
  ///
  /// # Errors
  /// `PoolNotFound` if `pool` is not registered.
  pub fn group(&self, pool: &str, futures: &[TaskHandle], tasks: &[ServiceTask]) -> Result<String, OrchestraError> {
    self.executor(pool)?;

    let group = Arc::new(ControllerGroup {
      id: Uuid::new_v4().to_string(),
      pool_name: pool.to_string(),
      tasks: tasks.to_vec(),
      handle_ids: futures.iter().map(TaskHandle::id).collect(),
    });
    self.controllers.register(&group);

    for future in futures {
      let group = group.clone();
      let failed = future.clone();
      future.on_failure(move |cause: TaskError| {
        let failed_task_id = failed.task().map(|task| task.id());
        let cancelled = group.cancel_others(failed_task_id);
        info!(
          controller_id = %group.id,
          handle_id = %failed.id(),
          cancelled,
          "Controller member failed ({}). Cancelled remaining siblings.",
          cause
        );
      });
    }

    debug!(controller_id = %group.id, pool_name = %pool, members = futures.len(), "Controller group registered.");
    Ok(group.id.clone())
  }

  /// Returns the live group registered under `id`.
  pub fn controller(&self, id: &str) -> Option<Arc<ControllerGroup>> {
    self.controllers.get(id)
  }

  /// Cancels every pending member of group `id`. `None` if the group is unknown or was
  /// already reclaimed.
  pub fn cancel_group(&self, id: &str) -> Option<usize> {
    let group = self.controllers.get(id)?;
    let cancelled = group.cancel_all();
    info!(controller_id = %id, cancelled, "Controller group cancelled.");
    Some(cancelled)
  }

  pub fn live_controller_count(&self) -> usize {
    self.controllers.live_count()
  }
}
