use crate::error::OrchestraError;
use crate::handle::TaskHandle;

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// What [`wait_all`] does when a member fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
  /// Return `OrchestraError::Failfast` on the first failed member.
  FailFast,
  /// Skip failed members without reporting them. Inspect the handles afterwards to
  /// learn about individual failures.
  IgnoreFailures,
}

impl From<bool> for WaitPolicy {
  fn from(failfast: bool) -> Self {
    if failfast {
      WaitPolicy::FailFast
    } else {
      WaitPolicy::IgnoreFailures
    }
  }
}

/// Waits for `handles` in order under one deadline of `timeout` from now.
///
/// If the deadline passes while waiting on a member, every handle in the batch is
/// cancelled and `Timeout` is returned. If the budget is already spent before a member
/// is awaited, `Timeout` is returned without cancelling anything. Results are left on
/// the handles.
pub async fn wait_all(handles: &[TaskHandle], timeout: Duration, policy: WaitPolicy) -> Result<(), OrchestraError> {
  let started = Instant::now();
  let deadline = started.checked_add(timeout).unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));

  if handles.is_empty() {
    return Ok(());
  }

  for (position, handle) in handles.iter().enumerate() {
    if Instant::now() >= deadline {
      debug!(position, "Wait budget exhausted before awaiting member.");
      return Err(OrchestraError::Timeout);
    }

    match tokio::time::timeout_at(deadline, handle.outcome()).await {
      Err(_elapsed) => {
        warn!(position, handle_id = %handle.id(), batch = handles.len(), "Deadline exceeded. Cancelling the whole batch.");
        for member in handles {
          member.cancel();
        }
        return Err(OrchestraError::Timeout);
      }
      Ok(Ok(_)) => trace!(position, handle_id = %handle.id(), "Member resolved."),
      Ok(Err(cause)) => match policy {
        WaitPolicy::FailFast => {
          debug!(position, handle_id = %handle.id(), "Member failed, failing fast: {}", cause);
          return Err(OrchestraError::Failfast(cause));
        }
        WaitPolicy::IgnoreFailures => {
          debug!(position, handle_id = %handle.id(), "Member failed, ignored: {}", cause);
        }
      },
    }
  }

  Ok(())
}
