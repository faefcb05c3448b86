//! Test doubles shared across module tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{Backend, BackendRequest, BackendResponse};
use crate::store::LogRecord;

enum Script {
  Respond(u16, Value),
  Fail(String),
}

/// Scripted backend: pops one scripted result per call, in order.
/// With nothing scripted, every call answers 200 with a null body.
pub struct FakeBackend {
  script: Mutex<VecDeque<Script>>,
  executed: Mutex<Vec<BackendRequest>>,
  fetched: Mutex<Vec<String>>,
  log_batches: Mutex<Vec<Vec<LogRecord>>>,
  delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      executed: Mutex::new(Vec::new()),
      fetched: Mutex::new(Vec::new()),
      log_batches: Mutex::new(Vec::new()),
      delay: Mutex::new(None),
    }
  }

  pub fn push_status(&self, status: u16) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Script::Respond(status, Value::Null));
  }

  pub fn push_json(&self, status: u16, body: Value) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Script::Respond(status, body));
  }

  pub fn push_error(&self, message: &str) {
    self
      .script
      .lock()
      .unwrap()
      .push_back(Script::Fail(message.to_string()));
  }

  /// Delay every call, to widen race windows in concurrency tests.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Mutating requests seen, in call order.
  pub fn executed(&self) -> Vec<BackendRequest> {
    self.executed.lock().unwrap().clone()
  }

  /// GET paths seen, in call order.
  pub fn fetched(&self) -> Vec<String> {
    self.fetched.lock().unwrap().clone()
  }

  /// Log batches seen, in call order.
  pub fn log_batches(&self) -> Vec<Vec<LogRecord>> {
    self.log_batches.lock().unwrap().clone()
  }

  async fn next(&self) -> Result<BackendResponse> {
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let script = self.script.lock().unwrap().pop_front();
    match script {
      Some(Script::Respond(status, body)) => Ok(BackendResponse {
        status,
        headers: BTreeMap::new(),
        body,
      }),
      Some(Script::Fail(message)) => Err(eyre!(message)),
      None => Ok(BackendResponse {
        status: 200,
        headers: BTreeMap::new(),
        body: Value::Null,
      }),
    }
  }
}

#[async_trait]
impl Backend for FakeBackend {
  async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse> {
    self.executed.lock().unwrap().push(request.clone());
    self.next().await
  }

  async fn fetch(&self, path: &str, _query: &[(String, String)]) -> Result<BackendResponse> {
    self.fetched.lock().unwrap().push(path.to_string());
    self.next().await
  }

  async fn push_logs(&self, records: &[LogRecord]) -> Result<BackendResponse> {
    self.log_batches.lock().unwrap().push(records.to_vec());
    self.next().await
  }
}
