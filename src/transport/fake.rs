//! Scripted transport for tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::{HttpRequest, HttpResponse, Transport, TransportError};

type Responder = Box<dyn FnMut(&HttpRequest) -> Result<HttpResponse, TransportError> + Send>;

/// A transport whose answers come from a closure. Every request is recorded.
pub(crate) struct FakeTransport {
  responder: Mutex<Responder>,
  calls: Mutex<Vec<HttpRequest>>,
  gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeTransport {
  pub(crate) fn new<F>(responder: F) -> Arc<Self>
  where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + 'static,
  {
    Arc::new(Self {
      responder: Mutex::new(Box::new(responder)),
      calls: Mutex::new(Vec::new()),
      gate: Mutex::new(None),
    })
  }

  /// Every request succeeds with `status`.
  pub(crate) fn answering(status: u16) -> Arc<Self> {
    Self::new(move |_| Ok(HttpResponse::new(status, "{}")))
  }

  /// Every request fails before reaching a server.
  pub(crate) fn unreachable() -> Arc<Self> {
    Self::new(|_| Err(TransportError::Unreachable("connection refused".into())))
  }

  pub(crate) fn respond_with<F>(&self, responder: F)
  where
    F: FnMut(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + 'static,
  {
    *self.responder.lock().unwrap() = Box::new(responder);
  }

  /// Hold every request until the returned `Notify` is signalled once per
  /// request.
  pub(crate) fn hold(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
    gate
  }

  pub(crate) fn calls(&self) -> Vec<HttpRequest> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
    self.calls.lock().unwrap().push(request.clone());
    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }
    let mut responder = self.responder.lock().unwrap();
    (*responder)(request)
  }
}
