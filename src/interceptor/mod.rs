//! Network interception layer.
//!
//! Every application request goes through [`InterceptionLayer::fetch`]. Reads
//! fall back to the local store when the network is gone; writes are captured
//! into the mutation queue and acknowledged as queued.
//!
//! The layer is deployed in generations. A new generation installs next to
//! the active one and waits until told to take over; the swap is atomic, so
//! each request is handled by exactly one generation.

mod lifecycle;
mod messages;
mod responses;
mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::ReadCache;
use crate::connectivity::Connectivity;
use crate::store::StoreError;
use crate::sync::MutationQueue;
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

pub use lifecycle::LifecycleState;
pub use messages::{ControlMessage, LayerMessage};
pub use responses::{offline_response, queued_response};

use messages::WorkerCommand;
use worker::{LayerDeps, Worker};

const COMMAND_BUFFER: usize = 64;
const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum InterceptError {
  #[error("local store failure: {0}")]
  Store(#[from] StoreError),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("no active interception layer")]
  NotActive,

  #[error("interception worker stopped before answering")]
  WorkerGone,
}

struct Deployment {
  generation: u64,
  commands: mpsc::Sender<WorkerCommand>,
  handle: JoinHandle<()>,
}

struct LayerInner {
  deps: LayerDeps,
  outbox: mpsc::Sender<LayerMessage>,
  active: RwLock<Option<Deployment>>,
  waiting: Mutex<Option<Deployment>>,
  states: Mutex<BTreeMap<u64, LifecycleState>>,
  retired: Mutex<Vec<JoinHandle<()>>>,
  next_generation: AtomicU64,
  // Serializes install / activate
  lifecycle: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct InterceptionLayer {
  inner: Arc<LayerInner>,
}

impl InterceptionLayer {
  /// Build the layer. The returned receiver carries [`LayerMessage`]s to the
  /// application.
  pub fn new(
    transport: Arc<dyn Transport>,
    queue: MutationQueue,
    read_cache: ReadCache,
    connectivity: Connectivity,
  ) -> (Self, mpsc::Receiver<LayerMessage>) {
    let (outbox, messages) = mpsc::channel(MESSAGE_BUFFER);
    let layer = Self {
      inner: Arc::new(LayerInner {
        deps: LayerDeps {
          transport,
          queue,
          read_cache,
          connectivity,
        },
        outbox,
        active: RwLock::new(None),
        waiting: Mutex::new(None),
        states: Mutex::new(BTreeMap::new()),
        retired: Mutex::new(Vec::new()),
        next_generation: AtomicU64::new(1),
        lifecycle: tokio::sync::Mutex::new(()),
      }),
    };
    (layer, messages)
  }

  /// Install a new generation and return its number.
  ///
  /// Installing opens the local store. The first generation activates
  /// immediately; later ones wait for [`skip_waiting`](Self::skip_waiting).
  pub async fn install(&self) -> Result<u64, InterceptError> {
    let _lifecycle = self.inner.lifecycle.lock().await;
    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
    self.set_state(generation, LifecycleState::Installing);

    if let Err(e) = self.inner.deps.queue.init().await {
      warn!(generation, error = %e, "interception layer install failed");
      self.set_state(generation, LifecycleState::Redundant);
      return Err(e.into());
    }

    let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
    let worker = Worker::new(generation, self.inner.deps.clone(), self.inner.outbox.clone());
    let deployment = Deployment {
      generation,
      commands,
      handle: worker.spawn(rx),
    };
    self.set_state(generation, LifecycleState::Waiting);

    if self.active_generation().is_none() {
      self.activate(deployment);
    } else {
      info!(generation, "interception layer installed, waiting");
      let replaced = self.lock_waiting().replace(deployment);
      if let Some(replaced) = replaced {
        self.retire(replaced);
      }
    }
    Ok(generation)
  }

  /// Promote the waiting generation. Returns its number, or `None` if
  /// nothing was waiting.
  pub async fn skip_waiting(&self) -> Option<u64> {
    let _lifecycle = self.inner.lifecycle.lock().await;
    let waiting = self.lock_waiting().take()?;
    let generation = waiting.generation;
    self.activate(waiting);
    Some(generation)
  }

  pub async fn post_message(&self, message: ControlMessage) {
    match message {
      ControlMessage::SkipWaiting => {
        self.skip_waiting().await;
      }
      ControlMessage::ClearCache => {
        if let Some(commands) = self.active_sender() {
          let _ = commands.send(WorkerCommand::ClearCache).await;
        }
      }
    }
  }

  /// Send `request` through the active generation.
  pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, InterceptError> {
    let commands = self.active_sender().ok_or(InterceptError::NotActive)?;
    let (reply, answer) = oneshot::channel();
    commands
      .send(WorkerCommand::Fetch { request, reply })
      .await
      .map_err(|_| InterceptError::WorkerGone)?;
    drop(commands);
    answer.await.map_err(|_| InterceptError::WorkerGone)?
  }

  pub fn active_generation(&self) -> Option<u64> {
    self.read_active().as_ref().map(|d| d.generation)
  }

  pub fn state_of(&self, generation: u64) -> Option<LifecycleState> {
    self.lock_states().get(&generation).copied()
  }

  /// Stop every generation after in-flight requests have been answered.
  pub async fn shutdown(&self) {
    let _lifecycle = self.inner.lifecycle.lock().await;
    let active = self.write_active().take();
    let waiting = self.lock_waiting().take();
    for deployment in active.into_iter().chain(waiting) {
      self.retire(deployment);
    }
    let handles: Vec<_> = self
      .inner
      .retired
      .lock()
      .map(|mut retired| retired.drain(..).collect())
      .unwrap_or_default();
    for handle in handles {
      let _ = handle.await;
    }
  }

  fn activate(&self, deployment: Deployment) {
    let generation = deployment.generation;
    self.set_state(generation, LifecycleState::Activating);
    let previous = self.write_active().replace(deployment);
    self.set_state(generation, LifecycleState::Active);
    info!(generation, "interception layer active");

    if let Some(previous) = previous {
      self.retire(previous);
    }
  }

  /// Stop accepting work for `deployment`. Requests it already accepted
  /// still complete.
  fn retire(&self, deployment: Deployment) {
    let Deployment {
      generation,
      commands,
      handle,
    } = deployment;
    drop(commands);
    self.set_state(generation, LifecycleState::Redundant);
    if let Ok(mut retired) = self.inner.retired.lock() {
      retired.retain(|h| !h.is_finished());
      retired.push(handle);
    }
  }

  fn set_state(&self, generation: u64, next: LifecycleState) {
    let mut states = self.lock_states();
    if let Some(current) = states.get(&generation) {
      if !current.can_become(next) {
        warn!(generation, ?current, ?next, "unexpected lifecycle transition");
      }
    }
    states.insert(generation, next);
  }

  fn active_sender(&self) -> Option<mpsc::Sender<WorkerCommand>> {
    self.read_active().as_ref().map(|d| d.commands.clone())
  }

  // Every critical section is a single replace or insert; poisoning is ignored.
  fn read_active(&self) -> std::sync::RwLockReadGuard<'_, Option<Deployment>> {
    self.inner.active.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, Option<Deployment>> {
    self.inner.active.write().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_waiting(&self) -> std::sync::MutexGuard<'_, Option<Deployment>> {
    self.inner.waiting.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_states(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, LifecycleState>> {
    self.inner.states.lock().unwrap_or_else(|e| e.into_inner())
  }
}
