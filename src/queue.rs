use crate::handle::{Completer, TaskHandle};
use crate::task::ServiceTask;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Decides which of two priorities is dequeued first.
///
/// `Ordering::Greater` means a task with priority `a` runs before one with priority `b`.
/// Equal priorities always fall back to submission order.
pub trait PriorityComparator: Send + Sync + 'static {
  fn compare(&self, a: i32, b: i32) -> Ordering;
}

/// Larger priority values are more urgent. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestFirst;

impl PriorityComparator for HighestFirst {
  fn compare(&self, a: i32, b: i32) -> Ordering {
    a.cmp(&b)
  }
}

/// Smaller priority values are more urgent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LowestFirst;

impl PriorityComparator for LowestFirst {
  fn compare(&self, a: i32, b: i32) -> Ordering {
    b.cmp(&a)
  }
}

/// A task waiting in a pool queue together with the producer side of its handle.
pub(crate) struct QueuedTask {
  seq: u64,
  pub(crate) task: ServiceTask,
  pub(crate) handle: TaskHandle,
  pub(crate) completer: Completer,
  comparator: Arc<dyn PriorityComparator>,
}

impl fmt::Debug for QueuedTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueuedTask")
      .field("seq", &self.seq)
      .field("task_id", &self.task.id())
      .field("priority", &self.task.priority())
      .finish_non_exhaustive()
  }
}

impl QueuedTask {
  pub(crate) fn into_parts(self) -> (ServiceTask, TaskHandle, Completer) {
    (self.task, self.handle, self.completer)
  }
}

impl PartialEq for QueuedTask {
  fn eq(&self, other: &Self) -> bool {
    self.seq == other.seq
  }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueuedTask {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .comparator
      .compare(self.task.priority(), other.task.priority())
      // Earlier submissions win ties.
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

struct QueueState {
  heap: BinaryHeap<QueuedTask>,
  next_seq: u64,
}

/// Unbounded priority queue feeding a single dispatcher.
///
/// Pushing never waits. The dispatcher parks on a `Notify` while the queue is empty.
pub(crate) struct TaskQueue {
  state: Mutex<QueueState>,
  ready: Notify,
  comparator: Arc<dyn PriorityComparator>,
}

impl fmt::Debug for TaskQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskQueue").field("len", &self.len()).finish_non_exhaustive()
  }
}

impl TaskQueue {
  pub(crate) fn new(comparator: Arc<dyn PriorityComparator>) -> Self {
    Self {
      state: Mutex::new(QueueState {
        heap: BinaryHeap::new(),
        next_seq: 0,
      }),
      ready: Notify::new(),
      comparator,
    }
  }

  pub(crate) fn push(&self, task: ServiceTask, handle: TaskHandle, completer: Completer) {
    {
      let mut state = self.state.lock();
      let seq = state.next_seq;
      state.next_seq += 1;
      state.heap.push(QueuedTask {
        seq,
        task,
        handle,
        completer,
        comparator: self.comparator.clone(),
      });
    }
    self.ready.notify_one();
  }

  pub(crate) fn pop(&self) -> Option<QueuedTask> {
    self.state.lock().heap.pop()
  }

  /// Waits for the most urgent task. Returns `None` once `closed` is cancelled and the
  /// queue has been emptied.
  pub(crate) async fn next(&self, closed: &CancellationToken) -> Option<QueuedTask> {
    loop {
      if let Some(entry) = self.pop() {
        return Some(entry);
      }
      if closed.is_cancelled() {
        return None;
      }
      tokio::select! {
        biased;
        _ = self.ready.notified() => {}
        _ = closed.cancelled() => {}
      }
    }
  }

  /// Removes every queued task, most urgent first.
  pub(crate) fn drain(&self) -> Vec<QueuedTask> {
    let mut heap = std::mem::take(&mut self.state.lock().heap);
    let mut drained = Vec::with_capacity(heap.len());
    while let Some(entry) = heap.pop() {
      drained.push(entry);
    }
    drained
  }

  pub(crate) fn len(&self) -> usize {
    self.state.lock().heap.len()
  }
}
