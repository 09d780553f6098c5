//! Background timers: delayed and periodic tasks that never block the caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Owns every task it spawns so they can be torn down together.
///
/// Only timers belong here. Work that must not be cut short (a queue drain)
/// runs on its own task and is waited for, not aborted.
#[derive(Clone, Default)]
pub struct Scheduler {
  tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
  closed: Arc<AtomicBool>,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `task` in the background, tracked for shutdown. Ignored once the
  /// scheduler has been shut down.
  pub fn spawn<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.is_closed() {
      return;
    }
    let handle = tokio::spawn(task);
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.retain(|t| !t.is_finished());
      tasks.push(handle);
    }
  }

  /// Run `task` once after `delay`.
  pub fn run_after<F>(&self, delay: Duration, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.spawn(async move {
      tokio::time::sleep(delay).await;
      task.await;
    });
  }

  /// Run `task` every `period`, first run one period from now. A slow run
  /// delays the next one instead of stacking up.
  pub fn run_every<F, Fut>(&self, period: Duration, mut task: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        task().await;
      }
    });
  }

  /// Number of tasks still running.
  pub fn active(&self) -> usize {
    self
      .tasks
      .lock()
      .map(|tasks| tasks.iter().filter(|t| !t.is_finished()).count())
      .unwrap_or(0)
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Abort every task spawned through this scheduler and refuse new ones.
  pub fn shutdown(&self) {
    self.closed.store(true, Ordering::Release);
    if let Ok(mut tasks) = self.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }
}
