//! Backend transport: replays queued calls and ships log batches.
//!
//! The HTTP client sits behind the [`Backend`] trait so the gateway, the
//! sync engine, and the tests all talk to the same seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::entry::Operation;
use crate::store::LogRecord;

/// Header carrying the client version marker for optimistic concurrency.
pub const CLIENT_VERSION_HEADER: &str = "X-Client-Version";

/// A mutating call ready to go over the wire.
#[derive(Debug, Clone)]
pub struct BackendRequest {
  pub operation: Operation,
  pub path: String,
  /// JSON body; `None` for bodyless verbs (DELETE).
  pub body: Option<Value>,
  pub headers: BTreeMap<String, String>,
  pub client_version: Option<String>,
}

/// A response the backend actually produced, whatever its status.
#[derive(Debug, Clone)]
pub struct BackendResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Value,
}

impl BackendResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Classification of a replay attempt.
///
/// `Err` from the transport means no response was received (network
/// failure, timeout) and is always retryable. A received non-2xx,
/// non-409 status is also retryable. 409 is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
  Success(u16),
  Conflict,
  Retryable(String),
}

impl ReplayOutcome {
  pub fn classify(result: Result<BackendResponse>) -> Self {
    match result {
      Ok(response) if response.is_success() => ReplayOutcome::Success(response.status),
      Ok(response) if response.status == 409 => ReplayOutcome::Conflict,
      Ok(response) => ReplayOutcome::Retryable(format!("Unexpected status {}", response.status)),
      Err(e) => ReplayOutcome::Retryable(e.to_string()),
    }
  }
}

/// Transport seam for all outgoing calls.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Execute a mutating call. `Ok` means a response was received (any
  /// status); `Err` means none was (the request may or may not have
  /// reached the server).
  async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse>;

  /// Execute a GET.
  async fn fetch(&self, path: &str, query: &[(String, String)]) -> Result<BackendResponse>;

  /// Ship a batch of diagnostic records in one call.
  async fn push_logs(&self, records: &[LogRecord]) -> Result<BackendResponse>;
}

/// Production backend over reqwest.
pub struct HttpBackend {
  client: reqwest::Client,
  base_url: Url,
  token: String,
  log_path: String,
}

impl HttpBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = Url::parse(&config.backend.url)
      .map_err(|e| eyre!("Invalid backend url {}: {}", config.backend.url, e))?;

    let token = Config::get_api_token()?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.backend.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
      log_path: config.backend.log_path.clone(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid request path {}: {}", path, e))
  }

  async fn finish(response: reqwest::Response) -> Result<BackendResponse> {
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.to_string(), v.to_string()))
      })
      .collect();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body: {}", e))?;
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok(BackendResponse {
      status,
      headers,
      body,
    })
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn execute(&self, request: &BackendRequest) -> Result<BackendResponse> {
    let method = reqwest::Method::from_bytes(request.operation.method().as_bytes())
      .map_err(|e| eyre!("Invalid method: {}", e))?;
    let url = self.endpoint(&request.path)?;

    let mut builder = self
      .client
      .request(method, url)
      .bearer_auth(&self.token);

    if let Some(version) = &request.client_version {
      builder = builder.header(CLIENT_VERSION_HEADER, version);
    }
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.path, e))?;

    Self::finish(response).await
  }

  async fn fetch(&self, path: &str, query: &[(String, String)]) -> Result<BackendResponse> {
    let url = self.endpoint(path)?;

    let response = self
      .client
      .get(url)
      .query(query)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?;

    Self::finish(response).await
  }

  async fn push_logs(&self, records: &[LogRecord]) -> Result<BackendResponse> {
    let url = self.endpoint(&self.log_path)?;

    let response = self
      .client
      .post(url)
      .bearer_auth(&self.token)
      .json(records)
      .send()
      .await
      .map_err(|e| eyre!("Log batch upload failed: {}", e))?;

    Self::finish(response).await
  }
}
