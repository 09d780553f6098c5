//! Wires the store, queue, processor, interception layer and status observer
//! into one handle the application holds.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::ReadCache;
use crate::config::Config;
use crate::connectivity::{became_online, Connectivity, HealthProbe};
use crate::interceptor::{ControlMessage, InterceptError, InterceptionLayer, LayerMessage};
use crate::scheduler::Scheduler;
use crate::status::{StatusObserver, StatusSnapshot};
use crate::store::{LocalStore, StoreLocation, StoreResult};
use crate::sync::{DrainReport, MutationQueue, QueuedMutation, SyncEvent, SyncProcessor};
use crate::transport::{HttpRequest, HttpResponse, Transport};

pub struct SyncEngine {
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  scheduler: Scheduler,
  queue: MutationQueue,
  processor: SyncProcessor,
  read_cache: ReadCache,
  layer: InterceptionLayer,
  observer: StatusObserver,
  messages: Mutex<Option<mpsc::Receiver<LayerMessage>>>,
  observing: AtomicBool,
  started: AtomicBool,
  periodic_interval: Duration,
  health_path: String,
  probe_interval: Duration,
}

impl SyncEngine {
  /// Build the engine. Nothing runs until [`start`](Self::start).
  pub fn new(config: &Config, transport: Arc<dyn Transport>, location: StoreLocation) -> Self {
    let store = Arc::new(LocalStore::new(location, config.store_schema()));
    // Optimistic until a request or probe says otherwise
    let connectivity = Connectivity::new(true);
    let scheduler = Scheduler::new();
    let queue = MutationQueue::new(Arc::clone(&store));
    let read_cache = ReadCache::new(store, config.cache_routes(), config.store.schema_version);
    let processor = SyncProcessor::new(
      queue.clone(),
      Arc::clone(&transport),
      connectivity.clone(),
      scheduler.clone(),
      config.retry_policy(),
    );
    let observer = StatusObserver::new(
      connectivity.clone(),
      processor.clone(),
      scheduler.clone(),
      config.reconnect_grace(),
    );
    let (layer, messages) = InterceptionLayer::new(
      Arc::clone(&transport),
      queue.clone(),
      read_cache.clone(),
      connectivity.clone(),
    );

    Self {
      transport,
      connectivity,
      scheduler,
      queue,
      processor,
      read_cache,
      layer,
      observer,
      messages: Mutex::new(Some(messages)),
      observing: AtomicBool::new(false),
      started: AtomicBool::new(false),
      periodic_interval: config.periodic_interval(),
      health_path: config.server.health_path.clone(),
      probe_interval: config.probe_interval(),
    }
  }

  /// Open the store, activate the interception layer and start the
  /// background drains. A store that cannot be opened is reported through
  /// the status snapshot and returned as an error; calling `start` again
  /// retries.
  pub async fn start(&self) -> Result<()> {
    self.start_with(true).await
  }

  /// Like [`start`](Self::start). With `background_sync` off no drain runs
  /// on its own (no startup, periodic or reconnect drain), which suits
  /// one-shot callers that drain explicitly.
  pub async fn start_with(&self, background_sync: bool) -> Result<()> {
    if self.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    if !self.observing.swap(true, Ordering::SeqCst) {
      self.observer.start();
    }

    // Installing opens the store and recovers interrupted items
    if let Err(e) = self.layer.install().await {
      self.started.store(false, Ordering::SeqCst);
      self
        .observer
        .report_error(&format!("Interception layer failed to install: {}", e))
        .await;
      return Err(eyre!("Failed to install interception layer: {}", e));
    }
    self.observer.clear_error().await;
    self.route_layer_messages();

    if !background_sync {
      info!("sync engine started, background sync off");
      return Ok(());
    }

    let processor = self.processor.clone();
    self.scheduler.run_every(self.periodic_interval, move || {
      spawned_drain(processor.clone(), "periodic")
    });

    let processor = self.processor.clone();
    let mut online = self.connectivity.subscribe();
    let mut was_online = *online.borrow_and_update();
    self.scheduler.spawn(async move {
      while became_online(&mut online, &mut was_online).await {
        spawned_drain(processor.clone(), "reconnect").await;
      }
    });

    self
      .scheduler
      .spawn(spawned_drain(self.processor.clone(), "startup"));
    info!(
      periodic_secs = self.periodic_interval.as_secs(),
      "sync engine started"
    );
    Ok(())
  }

  fn route_layer_messages(&self) {
    let Some(mut messages) = self.messages.lock().ok().and_then(|mut m| m.take()) else {
      return;
    };
    let observer = self.observer.clone();
    let processor = self.processor.clone();
    let scheduler = self.scheduler.clone();

    self.scheduler.spawn(async move {
      while let Some(message) = messages.recv().await {
        match message {
          LayerMessage::QueueSync(captured) => {
            debug!(method = %captured.method, url = %captured.url, "write queued by layer");
            observer.refresh().await;
          }
          LayerMessage::ProcessSyncQueue => {
            scheduler.spawn(spawned_drain(processor.clone(), "layer request"));
          }
        }
      }
    });
  }

  /// Poll the server's health endpoint to keep connectivity current while
  /// the application is idle.
  pub fn spawn_health_probe(&self) {
    HealthProbe::new(Arc::clone(&self.transport), &self.health_path).spawn(
      self.connectivity.clone(),
      &self.scheduler,
      self.probe_interval,
    );
  }

  /// Probe the health endpoint once and update connectivity.
  pub async fn check_health(&self) -> bool {
    HealthProbe::new(Arc::clone(&self.transport), &self.health_path)
      .check(&self.connectivity)
      .await
  }

  /// Send a request through the interception layer.
  pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, InterceptError> {
    self.layer.fetch(request).await
  }

  pub async fn post_message(&self, message: ControlMessage) {
    self.layer.post_message(message).await
  }

  pub fn layer(&self) -> &InterceptionLayer {
    &self.layer
  }

  pub fn status(&self) -> StatusSnapshot {
    self.observer.snapshot()
  }

  /// Recompute the snapshot now instead of waiting for the next change.
  pub async fn refresh_status(&self) -> StatusSnapshot {
    self.observer.refresh().await;
    self.observer.snapshot()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
    self.observer.subscribe()
  }

  pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
    self.processor.subscribe()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn read_cache(&self) -> &ReadCache {
    &self.read_cache
  }

  pub async fn process_queue(&self) -> StoreResult<DrainReport> {
    self.processor.process_queue().await
  }

  pub async fn retry_failed(&self) -> StoreResult<DrainReport> {
    self.processor.retry_failed().await
  }

  pub async fn discard(&self, id: &str) -> StoreResult<bool> {
    self.processor.discard(id).await
  }

  pub async fn pending_items(&self) -> StoreResult<Vec<QueuedMutation>> {
    self.queue.pending_items().await
  }

  pub async fn failed_items(&self) -> StoreResult<Vec<QueuedMutation>> {
    self.queue.failed_items().await
  }

  /// Stop timers, wait for a drain in flight to settle, then let the
  /// interception layer answer what it already accepted.
  pub async fn shutdown(&self) {
    self.scheduler.shutdown();
    self.processor.wait_idle().await;
    self.layer.shutdown().await;
    info!("sync engine stopped");
  }
}

async fn spawned_drain(processor: SyncProcessor, reason: &'static str) {
  debug!(reason, "drain requested");
  if let Err(e) = processor.process_queue().await {
    warn!(reason, error = %e, "drain failed");
  }
}
