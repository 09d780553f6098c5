//! Connectivity signal shared by every actor, plus a health probe that keeps
//! it current.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;
use crate::transport::{HttpRequest, Transport};

/// Live online/offline flag. Cheap to clone; all clones share one signal.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the signal. Returns true if this flipped it.
  pub fn set_online(&self, online: bool) -> bool {
    let flipped = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if flipped {
      if online {
        info!("connectivity restored");
      } else {
        warn!("connectivity lost");
      }
    }
    flipped
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

/// Wait for the next offline → online edge on `rx`, starting from
/// `was_online`. Read the starting value when subscribing, not inside the
/// waiting task, or a flip in between is lost. Returns false once the signal
/// is gone.
pub async fn became_online(rx: &mut watch::Receiver<bool>, was_online: &mut bool) -> bool {
  loop {
    if rx.changed().await.is_err() {
      return false;
    }
    let online = *rx.borrow_and_update();
    let edge = online && !*was_online;
    *was_online = online;
    if edge {
      return true;
    }
  }
}

/// Polls a health endpoint and mirrors reachability into a [`Connectivity`].
pub struct HealthProbe {
  transport: Arc<dyn Transport>,
  url: String,
}

impl HealthProbe {
  pub fn new(transport: Arc<dyn Transport>, url: &str) -> Self {
    Self {
      transport,
      url: url.to_string(),
    }
  }

  /// Check once. Any HTTP answer counts as reachable.
  pub async fn check(&self, connectivity: &Connectivity) -> bool {
    let reachable = match self.transport.send(&HttpRequest::get(&self.url)).await {
      Ok(response) => {
        debug!(status = response.status, "health probe answered");
        true
      }
      Err(e) => {
        debug!(error = %e, "health probe failed");
        false
      }
    };
    connectivity.set_online(reachable);
    reachable
  }

  /// Check every `interval` on `scheduler`.
  pub fn spawn(self, connectivity: Connectivity, scheduler: &Scheduler, interval: Duration) {
    let probe = Arc::new(self);
    scheduler.run_every(interval, move || {
      let probe = Arc::clone(&probe);
      let connectivity = connectivity.clone();
      async move {
        probe.check(&connectivity).await;
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::fake::FakeTransport;
  use crate::transport::{HttpResponse, TransportError};

  #[test]
  fn test_set_online_reports_flips_only() {
    let connectivity = Connectivity::new(false);
    assert!(connectivity.set_online(true));
    assert!(!connectivity.set_online(true));
    assert!(connectivity.is_online());
    assert!(connectivity.set_online(false));
  }

  #[tokio::test]
  async fn test_became_online_ignores_offline_flaps() {
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();
    let mut was_online = *rx.borrow_and_update();
    let waiter = tokio::spawn(async move { became_online(&mut rx, &mut was_online).await });

    tokio::task::yield_now().await;
    connectivity.set_online(false);
    tokio::task::yield_now().await;
    connectivity.set_online(true);
    assert!(waiter.await.unwrap());
  }

  #[tokio::test]
  async fn test_became_online_sees_flip_before_first_poll() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();
    let mut was_online = *rx.borrow_and_update();
    let waiter = tokio::spawn(async move { became_online(&mut rx, &mut was_online).await });

    // Flipped before the waiting task ever runs
    connectivity.set_online(true);
    assert!(waiter.await.unwrap());
  }

  #[tokio::test]
  async fn test_probe_flips_signal() {
    let transport = FakeTransport::answering(503);
    let probe = HealthProbe::new(transport.clone(), "/health");
    let connectivity = Connectivity::new(false);

    // Even an error status proves the server is reachable
    assert!(probe.check(&connectivity).await);
    assert!(connectivity.is_online());

    transport.respond_with(|_| Err(TransportError::Timeout));
    assert!(!probe.check(&connectivity).await);
    assert!(!connectivity.is_online());

    transport.respond_with(|_| Ok(HttpResponse::new(200, "ok")));
    assert!(probe.check(&connectivity).await);
    assert_eq!(transport.calls().len(), 3);
  }
}
