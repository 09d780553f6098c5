//! Mutation queue: captured writes waiting for delivery, kept in the
//! `sync_queue` collection.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{LocalStore, StoreResult, StoreTx, SYNC_QUEUE};

use super::types::{CapturedRequest, MutationStatus, QueuedMutation};

/// Handle to the persistent mutation queue. Cheap to clone.
#[derive(Clone)]
pub struct MutationQueue {
  inner: Arc<QueueInner>,
}

struct QueueInner {
  store: Arc<LocalStore>,
  ready: OnceCell<()>,
  next_seq: AtomicU64,
  changes: watch::Sender<u64>,
}

fn status_value(status: MutationStatus) -> Value {
  Value::from(status.as_str())
}

fn by_status(tx: &StoreTx<'_>, status: MutationStatus) -> StoreResult<Vec<QueuedMutation>> {
  tx.get_by_index(SYNC_QUEUE, "status", &status_value(status))
}

fn capture_order(items: &mut [QueuedMutation]) {
  items.sort_by_key(|item| (item.request.timestamp, item.seq));
}

impl MutationQueue {
  pub fn new(store: Arc<LocalStore>) -> Self {
    let (changes, _) = watch::channel(0);
    Self {
      inner: Arc::new(QueueInner {
        store,
        ready: OnceCell::new(),
        next_seq: AtomicU64::new(0),
        changes,
      }),
    }
  }

  pub fn store(&self) -> &Arc<LocalStore> {
    &self.inner.store
  }

  /// Open the store and recover from an interrupted run.
  ///
  /// Items left in `processing` by a previous process are put back to
  /// `pending`. Runs once; later calls return immediately.
  pub async fn init(&self) -> StoreResult<()> {
    self.inner.ready.get_or_try_init(|| self.recover()).await?;
    Ok(())
  }

  async fn recover(&self) -> StoreResult<()> {
    let (recovered, max_seq) = self
      .inner
      .store
      .transaction(|tx| {
        let mut stuck = by_status(tx, MutationStatus::Processing)?;
        for item in &mut stuck {
          item.status = MutationStatus::Pending;
        }
        tx.put(SYNC_QUEUE, &stuck)?;

        let all: Vec<QueuedMutation> = tx.get_all(SYNC_QUEUE)?;
        Ok((stuck.len(), all.iter().map(|i| i.seq).max()))
      })
      .await?;

    self
      .inner
      .next_seq
      .store(max_seq.map_or(0, |s| s + 1), Ordering::SeqCst);
    if recovered > 0 {
      info!(recovered, "reset interrupted mutations to pending");
      self.notify();
    }
    Ok(())
  }

  /// Receiver that changes whenever the queue contents change.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.inner.changes.subscribe()
  }

  fn notify(&self) {
    self.inner.changes.send_modify(|v| *v = v.wrapping_add(1));
  }

  /// Persist a captured write as a new pending item. Returns its id once the
  /// write has completed.
  pub async fn enqueue(&self, request: CapturedRequest) -> StoreResult<String> {
    self.init().await?;

    let item = QueuedMutation {
      id: Uuid::new_v4().to_string(),
      request,
      seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
      retry_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
    };
    self.inner.store.put_one(SYNC_QUEUE, &item).await?;
    debug!(id = %item.id, method = %item.request.method, url = %item.request.url, "mutation queued");

    self.notify();
    Ok(item.id)
  }

  pub async fn get(&self, id: &str) -> StoreResult<Option<QueuedMutation>> {
    self.init().await?;
    self.inner.store.get(SYNC_QUEUE, id).await
  }

  /// Pending items, oldest capture first.
  pub async fn pending_items(&self) -> StoreResult<Vec<QueuedMutation>> {
    self.items_with(MutationStatus::Pending).await
  }

  /// Items that exhausted their retries, oldest capture first.
  pub async fn failed_items(&self) -> StoreResult<Vec<QueuedMutation>> {
    self.items_with(MutationStatus::Failed).await
  }

  async fn items_with(&self, status: MutationStatus) -> StoreResult<Vec<QueuedMutation>> {
    self.init().await?;
    let mut items = self
      .inner
      .store
      .transaction(|tx| by_status(tx, status))
      .await?;
    capture_order(&mut items);
    Ok(items)
  }

  /// Number of items still awaiting delivery (pending or mid-replay).
  /// Failed items are counted separately by [`failed_count`].
  ///
  /// [`failed_count`]: MutationQueue::failed_count
  pub async fn count(&self) -> StoreResult<usize> {
    self.init().await?;
    self
      .inner
      .store
      .transaction(|tx| {
        let pending = tx.count_by_index(
          SYNC_QUEUE,
          "status",
          &status_value(MutationStatus::Pending),
        )?;
        let processing = tx.count_by_index(
          SYNC_QUEUE,
          "status",
          &status_value(MutationStatus::Processing),
        )?;
        Ok(pending + processing)
      })
      .await
  }

  pub async fn failed_count(&self) -> StoreResult<usize> {
    self.init().await?;
    self
      .inner
      .store
      .count_by_index(SYNC_QUEUE, "status", &status_value(MutationStatus::Failed))
      .await
  }

  /// Apply `f` to item `id` if `allowed` accepts its current state.
  /// Returns whether the item was updated.
  async fn update<P, F>(&self, id: &str, allowed: P, f: F) -> StoreResult<bool>
  where
    P: FnOnce(&QueuedMutation) -> bool + Send,
    F: FnOnce(&mut QueuedMutation) + Send,
  {
    self.init().await?;
    let updated = self
      .inner
      .store
      .transaction(|tx| {
        let Some(mut item) = tx.get::<QueuedMutation>(SYNC_QUEUE, id)? else {
          return Ok(false);
        };
        if !allowed(&item) {
          return Ok(false);
        }
        f(&mut item);
        tx.put_one(SYNC_QUEUE, &item)?;
        Ok(true)
      })
      .await?;

    if updated {
      self.notify();
    }
    Ok(updated)
  }

  /// Claim a pending item for replay. Returns false if it is no longer
  /// pending (discarded, or claimed elsewhere).
  pub async fn mark_processing(&self, id: &str) -> StoreResult<bool> {
    self
      .update(
        id,
        |item| item.status == MutationStatus::Pending,
        |item| item.status = MutationStatus::Processing,
      )
      .await
  }

  pub async fn mark_pending(&self, id: &str, retry_count: u32) -> StoreResult<bool> {
    self
      .update(
        id,
        |_| true,
        |item| {
          item.status = MutationStatus::Pending;
          item.retry_count = retry_count;
        },
      )
      .await
  }

  pub async fn mark_failed(&self, id: &str, retry_count: u32) -> StoreResult<bool> {
    self
      .update(
        id,
        |_| true,
        |item| {
          item.status = MutationStatus::Failed;
          item.retry_count = retry_count;
        },
      )
      .await
  }

  /// Return an item to the pending pool after a failed replay.
  pub async fn schedule_retry(&self, id: &str, retry_count: u32, error: &str) -> StoreResult<bool> {
    let error = error.to_string();
    self
      .update(
        id,
        |_| true,
        |item| {
          item.status = MutationStatus::Pending;
          item.retry_count = retry_count;
          item.last_error = Some(error);
        },
      )
      .await
  }

  /// Park an item as failed. It is skipped by drains until reset.
  pub async fn fail(&self, id: &str, retry_count: u32, error: &str) -> StoreResult<bool> {
    let error = error.to_string();
    self
      .update(
        id,
        |_| true,
        |item| {
          item.status = MutationStatus::Failed;
          item.retry_count = retry_count;
          item.last_error = Some(error);
        },
      )
      .await
  }

  pub async fn remove(&self, id: &str) -> StoreResult<bool> {
    self.init().await?;
    let removed = self.inner.store.remove(SYNC_QUEUE, id).await?;
    if removed {
      self.notify();
    }
    Ok(removed)
  }

  /// Drop an item the user gave up on. Items mid-replay cannot be discarded.
  pub async fn discard(&self, id: &str) -> StoreResult<bool> {
    self.init().await?;
    let removed = self
      .inner
      .store
      .transaction(|tx| match tx.get::<QueuedMutation>(SYNC_QUEUE, id)? {
        Some(item) if item.status != MutationStatus::Processing => tx.remove(SYNC_QUEUE, id),
        _ => Ok(false),
      })
      .await?;

    if removed {
      info!(id, "mutation discarded");
      self.notify();
    }
    Ok(removed)
  }

  /// Put every failed item back in the pending pool with a fresh retry budget.
  pub async fn reset_failed(&self) -> StoreResult<usize> {
    self.init().await?;
    let reset = self
      .inner
      .store
      .transaction(|tx| {
        let mut failed = by_status(tx, MutationStatus::Failed)?;
        for item in &mut failed {
          item.status = MutationStatus::Pending;
          item.retry_count = 0;
          item.last_error = None;
        }
        tx.put(SYNC_QUEUE, &failed)?;
        Ok(failed.len())
      })
      .await?;

    if reset > 0 {
      self.notify();
    }
    Ok(reset)
  }
}
