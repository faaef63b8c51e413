//! HTTP transport seam.
//!
//! Network calls go through the [`Transport`] trait so the replay queue,
//! gateway, form manager, and proxy agent can be exercised against a fake
//! transport in tests. Requests and responses are plain serializable records;
//! a queued request replays its method, URL, headers, and body byte-for-byte.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// HTTP methods recognized by the synchronization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether the method mutates server state, deciding the gateway's
  /// read path (cache) vs. write path (queue).
  pub fn is_mutating(&self) -> bool {
    !matches!(self, Method::Get | Method::Head)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

/// A captured outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
  pub url: String,
  pub method: Method,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method,
      headers: Vec::new(),
      body: None,
    }
  }
}

/// A received response. Transport errors (timeout, connection failure) are
/// `Err`; any HTTP response, including non-2xx, is `Ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
  pub status: u16,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn json(&self) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(&self.body)?)
  }
}

/// Trait for transports that can dispatch an [`HttpRequest`].
pub trait Transport: Send + Sync {
  fn send<'a>(
    &'a self,
    request: &'a HttpRequest,
    timeout: Duration,
  ) -> BoxFuture<'a, Result<HttpResponse>>;
}

/// Transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

impl Default for HttpTransport {
  fn default() -> Self {
    Self::new()
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

impl Transport for HttpTransport {
  fn send<'a>(
    &'a self,
    request: &'a HttpRequest,
    timeout: Duration,
  ) -> BoxFuture<'a, Result<HttpResponse>> {
    Box::pin(async move {
      let mut builder = self
        .client
        .request(to_reqwest_method(request.method), &request.url)
        .timeout(timeout);

      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
          SyncError::NetworkTimeout(timeout)
        } else {
          SyncError::NetworkFailure(e.to_string())
        }
      })?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| SyncError::NetworkFailure(format!("failed to read body: {}", e)))?
        .to_vec();

      Ok(HttpResponse {
        status,
        headers,
        body,
      })
    })
  }
}
