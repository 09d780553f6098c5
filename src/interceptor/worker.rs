//! One generation's request handler.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::ReadCache;
use crate::connectivity::Connectivity;
use crate::sync::{CapturedRequest, MutationQueue};
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

use super::messages::{LayerMessage, WorkerCommand};
use super::responses::{offline_response, queued_response};
use super::InterceptError;

const RUNTIME_CACHE_CAPACITY: usize = 256;

/// Everything a generation needs, shared by all generations.
#[derive(Clone)]
pub(crate) struct LayerDeps {
  pub transport: Arc<dyn Transport>,
  pub queue: MutationQueue,
  pub read_cache: ReadCache,
  pub connectivity: Connectivity,
}

/// Last successful GET response per URL. Owned by a single generation and
/// dropped with it.
#[derive(Default)]
struct RuntimeCache {
  entries: HashMap<String, HttpResponse>,
}

impl RuntimeCache {
  fn key(request: &HttpRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_bytes());
    hasher.update(b" ");
    hasher.update(request.url.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn insert(&mut self, request: &HttpRequest, response: &HttpResponse) {
    let key = Self::key(request);
    if self.entries.len() >= RUNTIME_CACHE_CAPACITY && !self.entries.contains_key(&key) {
      let oldest = self
        .entries
        .iter()
        .min_by_key(|(_, r)| r.completed_at)
        .map(|(k, _)| k.clone());
      if let Some(oldest) = oldest {
        self.entries.remove(&oldest);
      }
    }
    match self.entries.get(&key) {
      Some(existing) if existing.completed_at > response.completed_at => {}
      _ => {
        self.entries.insert(key, response.clone());
      }
    }
  }

  fn get(&self, request: &HttpRequest) -> Option<HttpResponse> {
    self.entries.get(&Self::key(request)).cloned()
  }
}

pub(crate) struct Worker {
  generation: u64,
  deps: LayerDeps,
  outbox: mpsc::Sender<LayerMessage>,
  runtime_cache: Mutex<RuntimeCache>,
}

impl Worker {
  pub(crate) fn new(generation: u64, deps: LayerDeps, outbox: mpsc::Sender<LayerMessage>) -> Self {
    Self {
      generation,
      deps,
      outbox,
      runtime_cache: Mutex::new(RuntimeCache::default()),
    }
  }

  /// Serve commands until every sender is gone. Requests already accepted
  /// are finished before the task exits.
  pub(crate) fn spawn(self, mut commands: mpsc::Receiver<WorkerCommand>) -> JoinHandle<()> {
    let worker = Arc::new(self);
    tokio::spawn(async move {
      let mut in_flight = JoinSet::new();
      while let Some(command) = commands.recv().await {
        match command {
          WorkerCommand::Fetch { request, reply } => {
            let worker = Arc::clone(&worker);
            in_flight.spawn(async move {
              let result = worker.handle(request).await;
              // The caller may have given up; nothing to do then
              let _ = reply.send(result);
            });
          }
          WorkerCommand::ClearCache => worker.clear_cache(),
        }
        while in_flight.try_join_next().is_some() {}
      }
      while in_flight.join_next().await.is_some() {}
      debug!(generation = worker.generation, "worker stopped");
    })
  }

  pub(crate) async fn handle(&self, request: HttpRequest) -> Result<HttpResponse, InterceptError> {
    match self.deps.transport.send(&request).await {
      Ok(response) => {
        if self.deps.connectivity.set_online(true) {
          self.post(LayerMessage::ProcessSyncQueue).await;
        }
        if request.method == "GET" && response.is_success() {
          if let Err(e) = self.deps.read_cache.record_response(&request, &response).await {
            warn!(url = %request.url, error = %e, "failed to cache response");
          }
          if let Ok(mut cache) = self.runtime_cache.lock() {
            cache.insert(&request, &response);
          }
        }
        Ok(response)
      }
      Err(TransportError::InvalidRequest(reason)) => {
        Err(TransportError::InvalidRequest(reason).into())
      }
      Err(e) => {
        debug!(method = %request.method, url = %request.url, error = %e, "network unavailable");
        self.deps.connectivity.set_online(false);
        if request.is_read() {
          Ok(self.read_fallback(&request).await)
        } else {
          self.capture(&request).await
        }
      }
    }
  }

  async fn read_fallback(&self, request: &HttpRequest) -> HttpResponse {
    if request.method != "GET" {
      return offline_response("You are offline and this request cannot be served from cache");
    }

    match self.deps.read_cache.fallback(&request.url).await {
      Ok(Some(cached)) => {
        debug!(
          collection = %cached.collection,
          records = cached.records,
          "served from local store"
        );
        return HttpResponse {
          completed_at: cached.last_updated,
          ..HttpResponse::new(200, cached.body)
        }
        .with_header("content-type", "application/json");
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "local store read failed"),
    }

    let hit = self
      .runtime_cache
      .lock()
      .ok()
      .and_then(|cache| cache.get(request));
    match hit {
      Some(response) => {
        debug!(url = %request.url, "served from response cache");
        response
      }
      None => offline_response("You are offline and no cached copy of this data exists"),
    }
  }

  /// Queue a write for later delivery. A write that cannot be persisted is
  /// reported as an error, never acknowledged.
  async fn capture(&self, request: &HttpRequest) -> Result<HttpResponse, InterceptError> {
    let captured = CapturedRequest::capture(request);
    let id = self.deps.queue.enqueue(captured.clone()).await?;
    info!(%id, method = %captured.method, url = %captured.url, "write captured for later sync");

    self.post(LayerMessage::QueueSync(captured)).await;
    Ok(queued_response(
      "You are offline. The change was saved and will be sent when the connection returns",
    ))
  }

  fn clear_cache(&self) {
    if let Ok(mut cache) = self.runtime_cache.lock() {
      let dropped = cache.entries.len();
      cache.entries.clear();
      info!(generation = self.generation, dropped, "response cache cleared");
    }
  }

  async fn post(&self, message: LayerMessage) {
    if self.outbox.send(message).await.is_err() {
      debug!("no application listening for layer messages");
    }
  }
}
