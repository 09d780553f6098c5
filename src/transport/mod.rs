//! The network seam: everything that leaves the device goes through a
//! [`Transport`].

mod client;
#[cfg(test)]
pub(crate) mod fake;
mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use client::HttpTransport;
pub use types::{HttpRequest, HttpResponse};

/// The request never produced an HTTP response.
///
/// Always retryable. A reachable server answering with an error status is
/// not a transport error; it comes back as an [`HttpResponse`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("server unreachable: {0}")]
  Unreachable(String),

  #[error("request timed out")]
  Timeout,

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}
