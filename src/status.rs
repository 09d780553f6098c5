//! Derived sync status for the UI: online/reconnecting state, queue badges and
//! the last sync outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connectivity::Connectivity;
use crate::scheduler::Scheduler;
use crate::sync::{MutationQueue, SyncEvent, SyncProcessor};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
  pub is_online: bool,
  /// Set for a short grace window right after connectivity returns
  pub is_reconnecting: bool,
  pub pending_sync_count: usize,
  pub failed_sync_count: usize,
  pub is_syncing: bool,
  pub last_sync_time: Option<DateTime<Utc>>,
  pub sync_error: Option<String>,
}

#[derive(Default)]
struct ObserverState {
  reconnecting: bool,
  // Bumped on every connectivity flip; a grace timer only ends its own window
  grace_generation: u64,
  init_error: Option<String>,
  drain_error: Option<String>,
}

struct ObserverInner {
  tx: watch::Sender<StatusSnapshot>,
  connectivity: Connectivity,
  queue: MutationQueue,
  processor: SyncProcessor,
  scheduler: Scheduler,
  grace: Duration,
  state: Mutex<ObserverState>,
  publish: tokio::sync::Mutex<()>,
}

/// Publishes a [`StatusSnapshot`] whenever something it depends on changes.
/// Never modifies the queue.
#[derive(Clone)]
pub struct StatusObserver {
  inner: Arc<ObserverInner>,
}

impl StatusObserver {
  pub fn new(
    connectivity: Connectivity,
    processor: SyncProcessor,
    scheduler: Scheduler,
    grace: Duration,
  ) -> Self {
    let (tx, _) = watch::channel(StatusSnapshot {
      is_online: connectivity.is_online(),
      ..StatusSnapshot::default()
    });
    Self {
      inner: Arc::new(ObserverInner {
        tx,
        connectivity,
        queue: processor.queue().clone(),
        processor,
        scheduler,
        grace,
        state: Mutex::new(ObserverState::default()),
        publish: tokio::sync::Mutex::new(()),
      }),
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
    self.inner.tx.subscribe()
  }

  pub fn snapshot(&self) -> StatusSnapshot {
    self.inner.tx.borrow().clone()
  }

  /// Start following connectivity, sync events and queue changes.
  pub fn start(&self) {
    let observer = self.clone();
    let mut online = self.inner.connectivity.subscribe();
    let mut events = self.inner.processor.subscribe();
    let mut changes = self.inner.queue.subscribe();
    let mut was_online = *online.borrow_and_update();

    self.inner.scheduler.spawn(async move {
      observer.refresh().await;
      loop {
        tokio::select! {
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            let now_online = *online.borrow_and_update();
            if now_online != was_online {
              observer.on_connectivity(now_online);
              was_online = now_online;
            }
          }
          event = events.recv() => match event {
            Ok(event) => observer.on_event(&event),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "status observer lagged behind sync events"),
            Err(RecvError::Closed) => break,
          },
          changed = changes.changed() => {
            if changed.is_err() {
              break;
            }
          }
        }
        observer.refresh().await;
      }
    });
  }

  /// Record an error that stays visible until cleared, such as a store that
  /// failed to open.
  pub async fn report_error(&self, error: &str) {
    warn!(%error, "sync error reported");
    self.with_state(|state| state.init_error = Some(error.to_string()));
    self.refresh().await;
  }

  pub async fn clear_error(&self) {
    self.with_state(|state| state.init_error = None);
    self.refresh().await;
  }

  fn on_connectivity(&self, online: bool) {
    let generation = self.with_state(|state| {
      state.grace_generation += 1;
      state.reconnecting = online;
      state.grace_generation
    });
    if !online {
      return;
    }

    let observer = self.clone();
    self.inner.scheduler.run_after(self.inner.grace, async move {
      let ended = observer.with_state(|state| {
        let current = state.grace_generation == generation;
        if current {
          state.reconnecting = false;
        }
        current
      });
      if ended {
        observer.refresh().await;
      }
    });
  }

  fn on_event(&self, event: &SyncEvent) {
    match event {
      SyncEvent::SyncCompleted { .. } => self.with_state(|state| state.drain_error = None),
      SyncEvent::SyncAborted { error } => {
        self.with_state(|state| state.drain_error = Some(error.clone()))
      }
      _ => {}
    }
  }

  /// Recompute the snapshot and publish it if anything changed.
  pub async fn refresh(&self) {
    let _publish = self.inner.publish.lock().await;

    let pending = match self.inner.queue.count().await {
      Ok(count) => Some(count),
      Err(e) => {
        debug!(error = %e, "pending count unavailable");
        None
      }
    };
    let failed = self.inner.queue.failed_count().await.ok();
    let (is_reconnecting, sync_error) = self.with_state(|state| {
      (
        state.reconnecting,
        state.init_error.clone().or_else(|| state.drain_error.clone()),
      )
    });
    let is_online = self.inner.connectivity.is_online();
    let is_syncing = self.inner.processor.is_syncing();
    let last_sync_time = self.inner.processor.last_sync();

    self.inner.tx.send_if_modified(|current| {
      let next = StatusSnapshot {
        is_online,
        is_reconnecting: is_online && is_reconnecting,
        pending_sync_count: pending.unwrap_or(current.pending_sync_count),
        failed_sync_count: failed.unwrap_or(current.failed_sync_count),
        is_syncing,
        last_sync_time,
        sync_error,
      };
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    });
  }

  fn with_state<R>(&self, f: impl FnOnce(&mut ObserverState) -> R) -> R {
    let mut state = self
      .inner
      .state
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    f(&mut state)
  }
}
