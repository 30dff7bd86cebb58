#![allow(dead_code)]

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use reactive_orchestra::{PoolConfig, PoolRegistry, Record, ServiceError, ServiceInvoker, ServiceRequest};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Test double for the service layer. Behaviour is picked from the service name:
///
/// - `sleep:<ms>` sleeps, then echoes its input (stops early if its token fires)
/// - `fail` returns a service error
/// - `fail-after:<ms>` sleeps, then returns a service error
/// - `panic` panics
/// - `hang` waits for its token, or ten seconds if it never fires
/// - anything else echoes its input
#[derive(Default)]
pub struct ScriptedInvoker {
  requests: Mutex<Vec<ServiceRequest>>,
}

impl ScriptedInvoker {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Every request seen so far, in the order execution started.
  pub fn requests(&self) -> Vec<ServiceRequest> {
    self.requests.lock().clone()
  }

  pub fn services(&self) -> Vec<String> {
    self.requests.lock().iter().map(|request| request.service.clone()).collect()
  }

  pub fn count(&self, service: &str) -> usize {
    self.requests.lock().iter().filter(|request| request.service == service).count()
  }

  pub fn request_for(&self, service: &str) -> Option<ServiceRequest> {
    self.requests.lock().iter().find(|request| request.service == service).cloned()
  }
}

impl ServiceInvoker for ScriptedInvoker {
  fn invoke(&self, request: ServiceRequest, cancellation: CancellationToken) -> BoxFuture<'static, Result<Record, ServiceError>> {
    self.requests.lock().push(request.clone());
    async move {
      let service = request.service.as_str();
      if let Some(ms) = service.strip_prefix("sleep:") {
        let ms: u64 = ms.parse().unwrap_or(0);
        tokio::select! {
          _ = cancellation.cancelled() => return Err(ServiceError::new("interrupted")),
          _ = sleep(Duration::from_millis(ms)) => {}
        }
        return Ok(request.input);
      }
      if let Some(ms) = service.strip_prefix("fail-after:") {
        sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
        return Err(ServiceError::new("boom"));
      }
      match service {
        "fail" => Err(ServiceError::new("boom")),
        "panic" => panic!("scripted service panicked"),
        "hang" => {
          tokio::select! {
            _ = cancellation.cancelled() => Err(ServiceError::new("interrupted")),
            _ = sleep(Duration::from_secs(10)) => Ok(request.input),
          }
        }
        _ => Ok(request.input),
      }
    }
    .boxed()
  }
}

pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reactive_orchestra=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

pub fn record(value: Value) -> Record {
  match value {
    Value::Object(map) => map,
    other => panic!("expected a JSON object, got {}", other),
  }
}

/// A registry with one pool named `pool_name` backed by a fresh scripted invoker.
pub fn registry_with_pool(pool_name: &str, size: usize) -> (PoolRegistry, Arc<ScriptedInvoker>) {
  let registry = PoolRegistry::with_shutdown_grace(Duration::from_secs(2));
  let invoker = ScriptedInvoker::new();
  registry
    .create_pool(pool_name, PoolConfig::new(size, tokio::runtime::Handle::current()), invoker.clone())
    .unwrap();
  (registry, invoker)
}
