use crate::error::{OrchestraError, TaskError};
use crate::executor::PriorityExecutor;
use crate::handle::TaskHandle;
use crate::registry::PoolRegistry;
use crate::task::{merge_records, ServiceTask, TaskSpec};

use std::sync::Arc;

use tracing::{debug, warn};

impl PoolRegistry {
  /// Runs `step` on `pool` once `upstream` succeeds and returns a handle to the
  /// downstream outcome.
  ///
  /// With `merge`, the upstream record is layered onto `step.input` (upstream keys win);
  /// otherwise the upstream record is discarded. An upstream failure is propagated to
  /// the returned handle without submitting anything. A step without a session
  /// inherits the upstream task's session.
  ///
  /// # Errors
  /// `PoolNotFound` if `pool` is not registered; checked before anything is scheduled.
  pub fn chain(&self, pool: &str, upstream: &TaskHandle, step: TaskSpec, merge: bool) -> Result<TaskHandle, OrchestraError> {
    let executor = self.executor(pool)?;
    Ok(chain_on(executor, upstream, step, merge))
  }

  /// Same as [`chain`](Self::chain), and additionally submits `fallback` to `pool` if
  /// `upstream` fails. The fallback is fire-and-forget: the returned handle still fails
  /// with the upstream cause.
  pub fn chain_with_fallback(
    &self,
    pool: &str,
    upstream: &TaskHandle,
    step: TaskSpec,
    merge: bool,
    fallback: TaskSpec,
  ) -> Result<TaskHandle, OrchestraError> {
    let executor = self.executor(pool)?;
    attach_fallback(executor.clone(), upstream, fallback);
    Ok(chain_on(executor, upstream, step, merge))
  }
}

fn inherit_session(mut spec: TaskSpec, upstream: &TaskHandle) -> TaskSpec {
  if spec.session.is_none() {
    spec.session = upstream.task().map(|task| task.session().to_string());
  }
  spec
}

fn chain_on(executor: Arc<PriorityExecutor>, upstream: &TaskHandle, step: TaskSpec, merge: bool) -> TaskHandle {
  let pool_name = Arc::new(executor.name().to_string());
  let (downstream, completer) = TaskHandle::pending(pool_name, executor.runtime().clone(), false);
  let downstream_ref = downstream.clone();
  let upstream_ref = upstream.clone();

  upstream.on_complete(move |outcome| {
    let record = match outcome {
      Ok(record) => record,
      Err(cause) => {
        debug!(upstream_id = %upstream_ref.id(), downstream_id = %downstream_ref.id(), "Upstream failed, propagating: {}", cause);
        completer.complete(Err(cause));
        return;
      }
    };

    let mut spec = inherit_session(step, &upstream_ref);
    if merge {
      spec.input = merge_records(&spec.input, &record);
    }
    let task = ServiceTask::new(spec);
    downstream_ref.bind(task.clone());

    match executor.submit(task, false) {
      Ok(submitted) => {
        debug!(
          upstream_id = %upstream_ref.id(),
          downstream_id = %downstream_ref.id(),
          submitted_id = %submitted.id(),
          "Chained task submitted."
        );
        submitted.on_complete(move |outcome| completer.complete(outcome));
      }
      Err(e) => {
        warn!(pool_name = %executor.name(), "Chained task could not be submitted: {}", e);
        completer.complete(Err(TaskError::Rejected {
          pool: executor.name().to_string(),
        }));
      }
    }
  });

  downstream
}

fn attach_fallback(executor: Arc<PriorityExecutor>, upstream: &TaskHandle, fallback: TaskSpec) {
  let upstream_ref = upstream.clone();
  upstream.on_failure(move |cause| {
    let task = ServiceTask::new(inherit_session(fallback, &upstream_ref));
    debug!(upstream_id = %upstream_ref.id(), service = %task.service(), "Upstream failed ({}), submitting error path.", cause);
    if let Err(e) = executor.submit(task, false) {
      warn!(pool_name = %executor.name(), "Error-path task could not be submitted: {}", e);
    }
  });
}
