//! Sync queue processor: replays captured mutations once the server is
//! reachable again.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::scheduler::Scheduler;
use crate::store::{StoreError, StoreResult};
use crate::transport::{Transport, TransportError};

use super::queue::MutationQueue;
use super::types::{DrainReport, QueuedMutation, SyncEvent};

/// How many times a failed replay is retried, and how long to wait between
/// attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  /// Delay before retry n is `backoff[n - 1]`; the last step repeats
  pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      backoff: vec![
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(15),
      ],
    }
  }
}

impl RetryPolicy {
  pub fn delay_for(&self, retry_count: u32) -> Duration {
    let step = retry_count.saturating_sub(1) as usize;
    self
      .backoff
      .get(step)
      .or_else(|| self.backoff.last())
      .copied()
      .unwrap_or_default()
  }
}

/// Handle to the processor. Clones share the same in-flight state.
#[derive(Clone)]
pub struct SyncProcessor {
  inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
  queue: MutationQueue,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  scheduler: Scheduler,
  policy: RetryPolicy,
  syncing: AtomicBool,
  idle: Notify,
  /// Earliest moment each backing-off item may be replayed again
  not_before: Mutex<HashMap<String, Instant>>,
  last_sync: Mutex<Option<DateTime<Utc>>>,
  events: broadcast::Sender<SyncEvent>,
}

/// Clears the syncing flag when a drain ends, however it ends.
struct DrainGuard(Arc<ProcessorInner>);

impl Drop for DrainGuard {
  fn drop(&mut self) {
    self.0.syncing.store(false, Ordering::Release);
    self.0.idle.notify_waiters();
  }
}

/// What one replay attempt came to.
enum Replay {
  Delivered,
  Rejected(String),
  Unreachable(String),
}

impl SyncProcessor {
  pub fn new(
    queue: MutationQueue,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    scheduler: Scheduler,
    policy: RetryPolicy,
  ) -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(ProcessorInner {
        queue,
        transport,
        connectivity,
        scheduler,
        policy,
        syncing: AtomicBool::new(false),
        idle: Notify::new(),
        not_before: Mutex::new(HashMap::new()),
        last_sync: Mutex::new(None),
        events,
      }),
    }
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.inner.queue
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.syncing.load(Ordering::Acquire)
  }

  /// Resolves once no drain is running.
  pub async fn wait_idle(&self) {
    loop {
      let notified = self.inner.idle.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      if !self.is_syncing() {
        return;
      }
      notified.await;
    }
  }

  /// When the last drain finished without a store failure.
  pub fn last_sync(&self) -> Option<DateTime<Utc>> {
    self.inner.last_sync.lock().ok().and_then(|t| *t)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.inner.events.send(event);
  }

  /// Replay every pending mutation that is due, oldest first.
  ///
  /// Returns an empty report without touching the queue when offline or when
  /// another drain is already running. The drain runs on its own task, so
  /// dropping or aborting the caller never cuts a replay in half.
  pub async fn process_queue(&self) -> StoreResult<DrainReport> {
    if !self.inner.connectivity.is_online() {
      debug!("offline, drain skipped");
      return Ok(DrainReport::default());
    }
    if self
      .inner
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("drain already in progress");
      return Ok(DrainReport::default());
    }

    let guard = DrainGuard(Arc::clone(&self.inner));
    let processor = self.clone();
    let drain = tokio::spawn(async move {
      processor.emit(SyncEvent::SyncStarted);
      let result = processor.drain().await;
      drop(guard);
      processor.finish(&result);
      result
    });

    match drain.await {
      Ok(result) => result,
      Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
      Err(e) => Err(StoreError::Interrupted(e.to_string())),
    }
  }

  fn finish(&self, result: &StoreResult<DrainReport>) {
    match result {
      Ok(report) => {
        if let Ok(mut last) = self.inner.last_sync.lock() {
          *last = Some(Utc::now());
        }
        if !report.is_empty() {
          info!(success = report.success, failed = report.failed, "drain finished");
        }
        self.emit(SyncEvent::SyncCompleted {
          success: report.success,
          failed: report.failed,
        });
      }
      Err(e) => {
        warn!(error = %e, "drain aborted by local store failure");
        self.emit(SyncEvent::SyncAborted {
          error: e.to_string(),
        });
      }
    }
  }

  async fn drain(&self) -> StoreResult<DrainReport> {
    let queue = &self.inner.queue;
    let mut report = DrainReport::default();

    for item in queue.pending_items().await? {
      if !self.inner.connectivity.is_online() {
        debug!("went offline mid-drain, stopping");
        break;
      }
      if self.inner.scheduler.is_closed() {
        debug!("shutting down, stopping drain");
        break;
      }
      if self.backing_off(&item.id) {
        continue;
      }
      if !queue.mark_processing(&item.id).await? {
        continue;
      }

      let replay = match self.inner.transport.send(&item.request.to_request()).await {
        Ok(response) if response.is_success() => Replay::Delivered,
        Ok(response) => Replay::Rejected(format!("server answered HTTP {}", response.status)),
        Err(TransportError::InvalidRequest(reason)) => Replay::Rejected(reason),
        Err(e) => Replay::Unreachable(e.to_string()),
      };

      match replay {
        Replay::Delivered => {
          queue.remove(&item.id).await?;
          self.clear_backoff(&item.id);
          debug!(id = %item.id, "mutation delivered");
          report.success += 1;
          self.emit(SyncEvent::ItemSynced { id: item.id });
        }
        Replay::Rejected(error) => {
          report.failed += 1;
          self.record_failure(&item, &error).await?;
        }
        Replay::Unreachable(error) => {
          // Not the item's fault: hand it back untouched and wait for the
          // next reconnect
          queue.schedule_retry(&item.id, item.retry_count, &error).await?;
          warn!(id = %item.id, %error, "server unreachable, drain stopped");
          self.inner.connectivity.set_online(false);
          break;
        }
      }
    }

    Ok(report)
  }

  fn backing_off(&self, id: &str) -> bool {
    self
      .inner
      .not_before
      .lock()
      .map(|gate| gate.get(id).is_some_and(|due| *due > Instant::now()))
      .unwrap_or(false)
  }

  fn clear_backoff(&self, id: &str) {
    if let Ok(mut gate) = self.inner.not_before.lock() {
      gate.remove(id);
    }
  }

  async fn record_failure(&self, item: &QueuedMutation, error: &str) -> StoreResult<()> {
    let queue = &self.inner.queue;
    let policy = &self.inner.policy;

    if item.retry_count < policy.max_retries {
      let retry_count = item.retry_count + 1;
      let delay = policy.delay_for(retry_count);
      queue.schedule_retry(&item.id, retry_count, error).await?;
      if let Ok(mut gate) = self.inner.not_before.lock() {
        gate.insert(item.id.clone(), Instant::now() + delay);
      }
      warn!(id = %item.id, retry_count, delay_ms = delay.as_millis() as u64, %error, "replay failed, retry scheduled");

      self
        .inner
        .scheduler
        .run_after(delay, scheduled_drain(self.clone()));
      self.emit(SyncEvent::RetryScheduled {
        id: item.id.clone(),
        retry_count,
        delay_ms: delay.as_millis() as u64,
      });
    } else {
      queue.fail(&item.id, item.retry_count, error).await?;
      self.clear_backoff(&item.id);
      warn!(id = %item.id, %error, "replay failed permanently, needs attention");
      self.emit(SyncEvent::ItemFailed {
        id: item.id.clone(),
        error: error.to_string(),
      });
    }
    Ok(())
  }

  /// Give every failed item a fresh retry budget and drain.
  pub async fn retry_failed(&self) -> StoreResult<DrainReport> {
    let count = self.inner.queue.reset_failed().await?;
    if count > 0 {
      info!(count, "failed mutations reset for retry");
      self.emit(SyncEvent::FailedReset { count });
    }
    self.process_queue().await
  }

  /// Drop an item instead of delivering it.
  pub async fn discard(&self, id: &str) -> StoreResult<bool> {
    let removed = self.inner.queue.discard(id).await?;
    if removed {
      self.clear_backoff(id);
      self.emit(SyncEvent::ItemDiscarded { id: id.to_string() });
    }
    Ok(removed)
  }
}

/// Boxed so that a drain's future does not contain itself.
fn scheduled_drain(processor: SyncProcessor) -> BoxFuture<'static, ()> {
  async move {
    if let Err(e) = processor.process_queue().await {
      warn!(error = %e, "scheduled drain failed");
    }
  }
  .boxed()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{LocalStore, StoreSchema};
  use crate::sync::types::{CapturedRequest, MutationStatus};
  use crate::transport::fake::FakeTransport;
  use crate::transport::{HttpResponse, TransportError};
  use std::collections::BTreeMap;

  struct Harness {
    queue: MutationQueue,
    transport: Arc<FakeTransport>,
    connectivity: Connectivity,
    scheduler: Scheduler,
    processor: SyncProcessor,
  }

  fn harness(transport: Arc<FakeTransport>, online: bool) -> Harness {
    let queue = MutationQueue::new(Arc::new(LocalStore::in_memory(StoreSchema::new(1))));
    let connectivity = Connectivity::new(online);
    let scheduler = Scheduler::new();
    let processor = SyncProcessor::new(
      queue.clone(),
      transport.clone(),
      connectivity.clone(),
      scheduler.clone(),
      RetryPolicy::default(),
    );
    Harness {
      queue,
      transport,
      connectivity,
      scheduler,
      processor,
    }
  }

  fn write(url: &str, body: &str, timestamp: i64) -> CapturedRequest {
    CapturedRequest {
      url: url.to_string(),
      method: "POST".to_string(),
      headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
      body: body.to_string(),
      timestamp,
    }
  }

  #[test]
  fn test_backoff_is_stepped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(5));
    assert_eq!(policy.delay_for(3), Duration::from_secs(15));
    assert_eq!(policy.delay_for(9), Duration::from_secs(15));
  }

  #[tokio::test]
  async fn test_offline_capture_then_reconnect_drains() {
    let h = harness(FakeTransport::answering(201), false);
    let mut events = h.processor.subscribe();
    h.queue
      .enqueue(write("/clients", r#"{"name":"Ana"}"#, 1))
      .await
      .unwrap();
    assert_eq!(h.queue.count().await.unwrap(), 1);

    // Refuses to replay while offline
    assert!(h.processor.process_queue().await.unwrap().is_empty());
    assert!(h.transport.calls().is_empty());

    h.connectivity.set_online(true);
    let report = h.processor.process_queue().await.unwrap();
    assert_eq!(report, DrainReport { success: 1, failed: 0 });
    assert_eq!(h.queue.count().await.unwrap(), 0);

    let sent = h.transport.calls();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, "POST");
    assert_eq!(sent[0].url, "/clients");
    assert_eq!(sent[0].body.as_deref(), Some(r#"{"name":"Ana"}"#));

    let mut completed = None;
    while let Ok(event) = events.try_recv() {
      if let SyncEvent::SyncCompleted { success, failed } = event {
        completed = Some((success, failed));
      }
    }
    assert_eq!(completed, Some((1, 0)));
    assert!(h.processor.last_sync().is_some());
  }

  #[tokio::test]
  async fn test_replay_follows_capture_order_and_delivers_once() {
    let h = harness(FakeTransport::answering(200), true);
    h.queue.enqueue(write("/calls/3", "c", 300)).await.unwrap();
    h.queue.enqueue(write("/calls/1", "a", 100)).await.unwrap();
    h.queue.enqueue(write("/calls/2", "b", 200)).await.unwrap();

    h.processor.process_queue().await.unwrap();
    h.processor.process_queue().await.unwrap();

    let urls: Vec<String> = h.transport.calls().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, ["/calls/1", "/calls/2", "/calls/3"]);
  }

  #[tokio::test]
  async fn test_concurrent_drains_collapse_into_one() {
    let h = harness(FakeTransport::answering(200), true);
    let gate = h.transport.hold();
    h.queue.enqueue(write("/clients", "{}", 1)).await.unwrap();

    let running = {
      let processor = h.processor.clone();
      tokio::spawn(async move { processor.process_queue().await })
    };
    while h.transport.calls().is_empty() {
      tokio::task::yield_now().await;
    }
    assert!(h.processor.is_syncing());

    for _ in 0..5 {
      let report = h.processor.process_queue().await.unwrap();
      assert!(report.is_empty());
    }
    // Skipped calls never shrink the queue
    assert_eq!(h.queue.count().await.unwrap(), 1);

    gate.notify_one();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.success, 1);
    assert_eq!(h.transport.calls().len(), 1);
    assert!(!h.processor.is_syncing());
    assert_eq!(h.queue.count().await.unwrap(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_errors_exhaust_retries_then_fail() {
    let h = harness(FakeTransport::answering(500), true);
    let id = h.queue.enqueue(write("/clients", "{}", 1)).await.unwrap();

    let report = h.processor.process_queue().await.unwrap();
    assert_eq!(report, DrainReport { success: 0, failed: 1 });
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, MutationStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.last_error.as_deref(), Some("server answered HTTP 500"));

    // Retries fire at +1s, +5s and +15s
    for (wait, expected_calls) in [(1, 2), (5, 3), (15, 4)] {
      tokio::time::sleep(Duration::from_secs(wait)).await;
      tokio::task::yield_now().await;
      assert_eq!(h.transport.calls().len(), expected_calls);
    }

    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.status, MutationStatus::Failed);
    assert_eq!(item.retry_count, 3);
    assert_eq!(h.queue.count().await.unwrap(), 0);
    assert_eq!(h.queue.failed_count().await.unwrap(), 1);

    // Failed items are left alone by later drains
    tokio::time::sleep(Duration::from_secs(60)).await;
    h.processor.process_queue().await.unwrap();
    assert_eq!(h.transport.calls().len(), 4);
    assert_eq!(h.scheduler.active(), 0);
  }

  #[tokio::test]
  async fn test_retry_failed_reenters_pending_pool() {
    let h = harness(FakeTransport::answering(200), true);
    let id = h.queue.enqueue(write("/clients", "{}", 1)).await.unwrap();
    h.queue.mark_failed(&id, 3).await.unwrap();

    assert!(h.processor.process_queue().await.unwrap().is_empty());
    let report = h.processor.retry_failed().await.unwrap();
    assert_eq!(report.success, 1);
    assert_eq!(h.queue.failed_count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_unreachable_server_stops_drain_without_spending_retries() {
    let h = harness(FakeTransport::unreachable(), true);
    let mut ids = Vec::new();
    for n in 0..3 {
      ids.push(h.queue.enqueue(write("/clients", "{}", n)).await.unwrap());
    }

    let report = h.processor.process_queue().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(h.transport.calls().len(), 1);
    assert!(!h.connectivity.is_online());
    assert_eq!(h.scheduler.active(), 0);

    for id in &ids {
      let item = h.queue.get(id).await.unwrap().unwrap();
      assert_eq!(item.status, MutationStatus::Pending);
      assert_eq!(item.retry_count, 0);
    }
    let first = h.queue.get(&ids[0]).await.unwrap().unwrap();
    assert!(first.last_error.is_some());

    // Refused until something brings connectivity back
    assert!(h.processor.process_queue().await.unwrap().is_empty());
    assert_eq!(h.transport.calls().len(), 1);

    h.transport
      .respond_with(|_| Ok(HttpResponse::new(204, "")));
    h.connectivity.set_online(true);
    let report = h.processor.process_queue().await.unwrap();
    assert_eq!(report, DrainReport { success: 3, failed: 0 });
    assert_eq!(h.queue.count().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_invalid_request_counts_as_failed_replay() {
    let h = harness(FakeTransport::answering(200), true);
    let id = h.queue.enqueue(write("/clients", "{}", 1)).await.unwrap();
    h.transport
      .respond_with(|_| Err(TransportError::InvalidRequest("bad header".into())));

    let report = h.processor.process_queue().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(h.connectivity.is_online());
    let item = h.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(item.retry_count, 1);
    h.scheduler.shutdown();
  }

  #[tokio::test]
  async fn test_drain_stops_when_connectivity_drops() {
    let h = harness(FakeTransport::answering(200), true);
    h.queue.enqueue(write("/a", "{}", 1)).await.unwrap();
    h.queue.enqueue(write("/b", "{}", 2)).await.unwrap();
    h.queue.enqueue(write("/c", "{}", 3)).await.unwrap();

    let connectivity = h.connectivity.clone();
    h.transport.respond_with(move |request| {
      if request.url == "/b" {
        connectivity.set_online(false);
      }
      Ok(HttpResponse::new(200, ""))
    });

    let report = h.processor.process_queue().await.unwrap();
    assert_eq!(report.success, 2);
    let urls: Vec<String> = h.transport.calls().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, ["/a", "/b"]);
    assert_eq!(h.queue.pending_items().await.unwrap().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_holds_per_item() {
    let h = harness(FakeTransport::answering(500), true);
    let slow = h.queue.enqueue(write("/slow", "{}", 1)).await.unwrap();
    h.queue.schedule_retry(&slow, 2, "earlier failure").await.unwrap();
    h.queue.enqueue(write("/fast", "{}", 2)).await.unwrap();

    // /slow moves to its 15s step, /fast to its 1s step
    h.processor.process_queue().await.unwrap();
    let replays = |url: &str| h.transport.calls().iter().filter(|r| r.url == url).count();
    assert_eq!((replays("/slow"), replays("/fast")), (1, 1));

    // The 1s and 5s re-drains belong to /fast and must leave /slow waiting
    tokio::time::sleep(Duration::from_millis(1500)).await;
    tokio::task::yield_now().await;
    assert_eq!((replays("/slow"), replays("/fast")), (1, 2));
    tokio::time::sleep(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    assert_eq!((replays("/slow"), replays("/fast")), (1, 3));

    tokio::time::sleep(Duration::from_secs(9)).await;
    tokio::task::yield_now().await;
    assert_eq!(replays("/slow"), 2);
    let item = h.queue.get(&slow).await.unwrap().unwrap();
    assert_eq!(item.status, MutationStatus::Failed);
    h.scheduler.shutdown();
  }

  #[tokio::test]
  async fn test_aborted_caller_does_not_cut_replay_short() {
    let h = harness(FakeTransport::answering(200), true);
    let gate = h.transport.hold();
    let id = h.queue.enqueue(write("/clients", "{}", 1)).await.unwrap();

    let caller = {
      let processor = h.processor.clone();
      tokio::spawn(async move { processor.process_queue().await })
    };
    while h.transport.calls().is_empty() {
      tokio::task::yield_now().await;
    }
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());
    assert!(h.processor.is_syncing());

    gate.notify_one();
    h.processor.wait_idle().await;
    assert!(h.queue.get(&id).await.unwrap().is_none());
    assert_eq!(h.transport.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_discard_removes_and_notifies() {
    let h = harness(FakeTransport::answering(200), false);
    let mut events = h.processor.subscribe();
    let id = h.queue.enqueue(write("/clients", "{}", 1)).await.unwrap();
    h.queue.mark_failed(&id, 3).await.unwrap();

    assert!(h.processor.discard(&id).await.unwrap());
    assert!(!h.processor.discard(&id).await.unwrap());
    assert_eq!(
      events.try_recv().unwrap(),
      SyncEvent::ItemDiscarded { id: id.clone() }
    );
    assert_eq!(h.queue.failed_count().await.unwrap(), 0);
  }
}
