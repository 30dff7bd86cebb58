use reactive_orchestra::{
  wait_all, PoolConfig, PoolRegistry, Record, ServiceError, ServiceRequest, ServiceTask, TaskSpec, WaitPolicy,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn run_service(request: ServiceRequest, cancellation: CancellationToken) -> Result<Record, ServiceError> {
  info!("Service {} starting for session {} with input {:?}", request.service, request.session, request.input);
  let delay = Duration::from_millis(100 + request.priority.unsigned_abs() as u64 * 50);
  tokio::select! {
    _ = cancellation.cancelled() => return Err(ServiceError::new("interrupted")),
    _ = tokio::time::sleep(delay) => {}
  }
  if request.service == "charge-card" {
    return Err(ServiceError::new("card declined"));
  }

  let mut output = Record::new();
  output.insert(format!("{}_done", request.service), Value::Bool(true));
  Ok(output)
}

fn record(value: Value) -> Record {
  value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Pipeline Example ---");

  let registry = PoolRegistry::new();
  registry
    .create_pool("orders", PoolConfig::new(2, Handle::current()), Arc::new(run_service))
    .expect("Pool creation failed");
  registry
    .add_completion_handler("orders", |info| info!("Completed: {} -> {:?}", info.service, info.status))
    .expect("Pool vanished");

  // A two step pipeline whose second step sees the first step's output.
  let lookup = registry
    .submit("orders", TaskSpec::new("lookup-customer", record(json!({"order": 42}))).session("demo"))
    .expect("Submit failed");
  let invoice = registry
    .chain("orders", &lookup, TaskSpec::new("build-invoice", Record::new()), true)
    .expect("Chain failed");
  match invoice.outcome().await {
    Ok(output) => info!("Invoice built: {:?}", output),
    Err(e) => info!("Invoice failed: {}", e),
  }

  // A failing step triggers its compensation task.
  let charge = registry
    .submit("orders", TaskSpec::new("charge-card", Record::new()).priority(2))
    .expect("Submit failed");
  let shipped = registry
    .chain_with_fallback(
      "orders",
      &charge,
      TaskSpec::new("ship", Record::new()),
      false,
      TaskSpec::new("refund", record(json!({"order": 42}))),
    )
    .expect("Chain failed");
  info!("Shipping outcome: {:?}", shipped.outcome().await);

  // A cohort that cancels itself when any member fails, waited on under one deadline.
  let members: Vec<ServiceTask> = ["reserve-stock", "charge-card", "notify"]
    .into_iter()
    .map(|service| TaskSpec::new(service, Record::new()).interruptable(true).into())
    .collect();
  let handles: Vec<_> = members
    .iter()
    .map(|task| registry.submit_controller("orders", task.clone()).expect("Submit failed"))
    .collect();
  let controller_id = registry.group("orders", &handles, &members).expect("Group failed");
  info!("Cohort {} submitted.", controller_id);

  match wait_all(&handles, Duration::from_secs(2), WaitPolicy::FailFast).await {
    Ok(()) => info!("Cohort finished."),
    Err(e) => info!("Cohort stopped: {}", e),
  }

  info!("Pools: {}", registry.introspect());
  registry.shutdown_all().await;
  info!("--- Pipeline Example End ---");
}
