//! A Tokio-based runtime for dispatching service tasks onto named priority pools,
//! chaining tasks on each other's results, cancelling sibling cohorts on first
//! failure, and waiting on batches under a shared deadline.

mod chain;
mod controller;
mod error;
mod executor;
mod handle;
mod notifier;
mod queue;
mod registry;
mod task;
mod waiter;

pub use controller::{ControllerGroup, ControllerRegistry};
pub use error::{OrchestraError, ServiceError, TaskError};
pub use executor::{PoolConfig, PriorityExecutor};
pub use handle::{TaskHandle, TaskOutcome};
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use queue::{HighestFirst, LowestFirst, PriorityComparator};
pub use registry::{PoolRegistry, PoolStats, DEFAULT_SHUTDOWN_GRACE};
pub use task::{merge_records, Record, ServiceInvoker, ServiceRequest, ServiceTask, TaskSpec, DEFAULT_SESSION};
pub use waiter::{wait_all, WaitPolicy};
