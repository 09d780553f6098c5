use serde_json::Value;
use std::collections::BTreeMap;

/// An outgoing request as the application issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
  /// Upper-case HTTP verb
  pub method: String,
  /// Absolute URL or a path relative to the server base URL
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
}

impl HttpRequest {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: &str) -> Self {
    Self::new("GET", url)
  }

  pub fn post(url: &str, body: &str) -> Self {
    Self::new("POST", url).with_body(body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: &str) -> Self {
    self.body = Some(body.to_string());
    self
  }

  /// Idempotent fetches that may be answered from cache.
  /// Everything else is a mutation.
  pub fn is_read(&self) -> bool {
    matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
  }
}

/// A complete response, body fully read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: String,
  /// When the response finished arriving (epoch ms)
  pub completed_at: i64,
}

impl HttpResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      completed_at: crate::now_ms(),
    }
  }

  pub fn json(status: u16, payload: &Value) -> Self {
    Self::new(status, payload.to_string()).with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}
