use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{HttpRequest, HttpResponse, Transport, TransportError};

/// Transport backed by a shared `reqwest` client.
///
/// Relative request URLs are resolved against the configured server base URL.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
    let base_url = Url::parse(base_url)
      .map_err(|e| TransportError::InvalidRequest(format!("bad base url {}: {}", base_url, e)))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::InvalidRequest(format!("failed to build client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn resolve(&self, url: &str) -> Result<Url, TransportError> {
    self
      .base_url
      .join(url)
      .map_err(|e| TransportError::InvalidRequest(format!("bad url {}: {}", url, e)))
  }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
  let mut map = HeaderMap::new();
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| TransportError::InvalidRequest(format!("bad header {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
      .map_err(|e| TransportError::InvalidRequest(format!("bad header value: {}", e)))?;
    map.insert(name, value);
  }
  Ok(map)
}

fn classify(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Unreachable(err.to_string())
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
    let url = self.resolve(&request.url)?;
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| TransportError::InvalidRequest(format!("bad method: {}", e)))?;

    let mut builder = self
      .client
      .request(method, url.clone())
      .headers(header_map(&request.headers)?);
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(classify)?;
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

    // A body cut off mid-stream counts as a transport failure
    let body = response.text().await.map_err(classify)?;
    debug!(method = %request.method, %url, status, "request completed");

    Ok(HttpResponse {
      status,
      headers,
      body,
      completed_at: crate::now_ms(),
    })
  }
}
