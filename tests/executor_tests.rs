mod common;

use common::{record, registry_with_pool, setup_tracing_for_test};
use reactive_orchestra::{LowestFirst, OrchestraError, PoolConfig, PoolRegistry, Record, TaskError, TaskSpec};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn test_submit_and_await_echo_task() {
  setup_tracing_for_test();
  let (registry, invoker) = registry_with_pool("exec_basic", 2);

  let handle = registry
    .submit("exec_basic", TaskSpec::new("echo", record(json!({"k": "v"}))).session("s-1"))
    .unwrap();
  assert_eq!(handle.outcome().await, Ok(record(json!({"k": "v"}))));
  assert!(handle.is_done());
  assert!(!handle.is_controller_entry());

  let request = invoker.request_for("echo").unwrap();
  assert_eq!(request.session.as_ref(), "s-1");
  assert_eq!(handle.task().unwrap().id(), request.task_id);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_higher_priority_starts_first_on_single_worker() {
  setup_tracing_for_test();
  let (registry, invoker) = registry_with_pool("exec_priority", 1);

  // Occupy the only worker so both tasks wait for the slot together.
  let blocker = registry.submit("exec_priority", TaskSpec::new("sleep:100", Record::new())).unwrap();
  sleep(Duration::from_millis(20)).await;

  let t2 = registry.submit("exec_priority", TaskSpec::new("low", Record::new()).priority(1)).unwrap();
  let t1 = registry.submit("exec_priority", TaskSpec::new("high", Record::new()).priority(5)).unwrap();

  for handle in [&blocker, &t2, &t1] {
    handle.outcome().await.unwrap();
  }
  assert_eq!(invoker.services(), vec!["sleep:100", "high", "low"]);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_equal_priorities_run_in_submission_order() {
  setup_tracing_for_test();
  let (registry, invoker) = registry_with_pool("exec_fifo", 1);

  let blocker = registry.submit("exec_fifo", TaskSpec::new("sleep:80", Record::new())).unwrap();
  sleep(Duration::from_millis(20)).await;

  let mut handles = vec![blocker];
  for name in ["a", "b", "c", "d"] {
    handles.push(registry.submit("exec_fifo", TaskSpec::new(name, Record::new()).priority(3)).unwrap());
  }
  for handle in &handles {
    handle.outcome().await.unwrap();
  }
  assert_eq!(invoker.services(), vec!["sleep:80", "a", "b", "c", "d"]);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_random_priorities_drain_in_priority_then_submission_order() {
  use rand::Rng;
  setup_tracing_for_test();
  let (registry, invoker) = registry_with_pool("exec_random", 1);

  let blocker = registry.submit("exec_random", TaskSpec::new("sleep:80", Record::new())).unwrap();
  sleep(Duration::from_millis(20)).await;

  let mut rng = rand::rng();
  let mut submitted = Vec::new();
  let mut handles = vec![blocker];
  for index in 0..20 {
    let priority: i32 = rng.random_range(-3..=3);
    let service = format!("job-{}", index);
    handles.push(
      registry
        .submit("exec_random", TaskSpec::new(service.clone(), Record::new()).priority(priority))
        .unwrap(),
    );
    submitted.push((priority, index, service));
  }
  for handle in &handles {
    handle.outcome().await.unwrap();
  }

  submitted.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
  let mut expected = vec!["sleep:80".to_string()];
  expected.extend(submitted.into_iter().map(|(_, _, service)| service));
  assert_eq!(invoker.services(), expected);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_lowest_first_comparator_is_pluggable() {
  setup_tracing_for_test();
  let registry = PoolRegistry::new();
  let invoker = common::ScriptedInvoker::new();
  registry
    .create_pool(
      "exec_lowest",
      PoolConfig::new(1, tokio::runtime::Handle::current()).with_comparator(LowestFirst),
      invoker.clone(),
    )
    .unwrap();

  let blocker = registry.submit("exec_lowest", TaskSpec::new("sleep:80", Record::new())).unwrap();
  sleep(Duration::from_millis(20)).await;
  let p9 = registry.submit("exec_lowest", TaskSpec::new("p9", Record::new()).priority(9)).unwrap();
  let p1 = registry.submit("exec_lowest", TaskSpec::new("p1", Record::new()).priority(1)).unwrap();

  for handle in [&blocker, &p9, &p1] {
    handle.outcome().await.unwrap();
  }
  assert_eq!(invoker.services(), vec!["sleep:80", "p1", "p9"]);

  registry.close_pool("exec_lowest", Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_service_failure_and_panic_surface_on_handle() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_failures", 2);

  let failing = registry.submit("exec_failures", TaskSpec::new("fail", Record::new())).unwrap();
  let panicking = registry.submit("exec_failures", TaskSpec::new("panic", Record::new())).unwrap();

  assert_eq!(
    failing.outcome().await,
    Err(TaskError::Service {
      service: "fail".to_string(),
      message: "boom".to_string()
    })
  );
  assert_eq!(panicking.outcome().await, Err(TaskError::Panicked));

  // The pool keeps working after a panic.
  let healthy = registry.submit("exec_failures", TaskSpec::new("echo", Record::new())).unwrap();
  assert_eq!(healthy.outcome().await, Ok(Record::new()));

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_cancel_running_interruptable_task() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_cancel_running", 1);

  let handle = registry
    .submit("exec_cancel_running", TaskSpec::new("hang", Record::new()).interruptable(true))
    .unwrap();
  sleep(Duration::from_millis(30)).await;
  handle.cancel();

  let outcome = handle.outcome_timeout(Duration::from_secs(1)).await.unwrap();
  assert_eq!(outcome, Err(TaskError::Cancelled));
  assert!(handle.task().unwrap().is_cancel_requested());

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_cancel_queued_interruptable_task_never_runs() {
  setup_tracing_for_test();
  let (registry, invoker) = registry_with_pool("exec_cancel_queued", 1);

  let blocker = registry.submit("exec_cancel_queued", TaskSpec::new("sleep:60", Record::new())).unwrap();
  let queued = registry
    .submit("exec_cancel_queued", TaskSpec::new("never", Record::new()).interruptable(true))
    .unwrap();
  queued.cancel();

  blocker.outcome().await.unwrap();
  assert_eq!(queued.outcome().await, Err(TaskError::Cancelled));
  assert_eq!(invoker.count("never"), 0);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_cancel_non_interruptable_task_runs_to_completion() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_cancel_stubborn", 1);

  let handle = registry
    .submit("exec_cancel_stubborn", TaskSpec::new("sleep:60", record(json!({"done": true}))))
    .unwrap();
  sleep(Duration::from_millis(10)).await;
  handle.cancel();

  assert_eq!(handle.outcome().await, Ok(record(json!({"done": true}))));
  assert!(handle.is_cancellation_requested());

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_callbacks_fire_for_success_and_failure() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_callbacks", 2);
  let successes = Arc::new(AtomicUsize::new(0));
  let failures = Arc::new(AtomicUsize::new(0));

  let ok = registry.submit("exec_callbacks", TaskSpec::new("sleep:20", Record::new())).unwrap();
  let bad = registry.submit("exec_callbacks", TaskSpec::new("fail", Record::new())).unwrap();
  for handle in [&ok, &bad] {
    let successes = successes.clone();
    let failures = failures.clone();
    handle.on_success(move |_| {
      successes.fetch_add(1, Ordering::SeqCst);
    });
    handle.on_failure(move |_| {
      failures.fetch_add(1, Ordering::SeqCst);
    });
  }

  let _ = ok.outcome().await;
  let _ = bad.outcome().await;
  sleep(Duration::from_millis(20)).await;
  assert_eq!(successes.load(Ordering::SeqCst), 1);
  assert_eq!(failures.load(Ordering::SeqCst), 1);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_resize_allows_more_parallel_tasks() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_resize", 1);

  registry.resize_pool("exec_resize", 3).unwrap();
  let handles: Vec<_> = (0..3)
    .map(|_| registry.submit("exec_resize", TaskSpec::new("sleep:150", Record::new())).unwrap())
    .collect();
  sleep(Duration::from_millis(50)).await;

  let stats = registry.pool_stats("exec_resize").unwrap();
  assert_eq!(stats.core_pool_size, 3);
  assert_eq!(stats.active_count, 3);
  assert_eq!(stats.queued, 0);

  for handle in &handles {
    handle.outcome().await.unwrap();
  }
  assert_eq!(registry.pool_stats("exec_resize").unwrap().active_count, 0);

  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_shrinking_pool_limits_parallelism() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_shrink", 3);

  registry.resize_pool("exec_shrink", 1).unwrap();
  sleep(Duration::from_millis(20)).await;
  let handles: Vec<_> = (0..3)
    .map(|_| registry.submit("exec_shrink", TaskSpec::new("sleep:100", Record::new())).unwrap())
    .collect();
  sleep(Duration::from_millis(40)).await;

  let stats = registry.pool_stats("exec_shrink").unwrap();
  assert_eq!(stats.core_pool_size, 1);
  assert_eq!(stats.active_count, 1);
  assert_eq!(stats.queued, 2);

  for handle in &handles {
    handle.outcome().await.unwrap();
  }
  registry.shutdown_all().await;
}

#[tokio::test]
async fn test_resize_rejects_zero_and_unknown_pool() {
  setup_tracing_for_test();
  let (registry, _invoker) = registry_with_pool("exec_resize_bad", 1);

  assert_eq!(registry.resize_pool("exec_resize_bad", 0), Err(OrchestraError::InvalidPoolSize(0)));
  assert_eq!(
    registry.resize_pool("missing", 4),
    Err(OrchestraError::PoolNotFound("missing".to_string()))
  );

  registry.shutdown_all().await;
}
