//! Periodic background refresh, one task per resource.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Owns the refresh timers of a component or session.
///
/// Scheduling a key that already has a timer replaces it, so there is at most
/// one outstanding timer per resource. Dropping the scheduler cancels them all.
#[derive(Default)]
pub struct RefreshScheduler {
  tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RefreshScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `tick` every `period`, starting one period from now.
  pub fn schedule<F, Fut>(&self, key: impl Into<String>, period: Duration, tick: F)
  where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let key = key.into();
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        debug!(key = %task_key, "Background refresh");
        tick().await;
      }
    });

    let previous = match self.tasks.lock() {
      Ok(mut tasks) => tasks.insert(key, handle),
      Err(poisoned) => poisoned.into_inner().insert(key, handle),
    };
    if let Some(previous) = previous {
      previous.abort();
    }
  }

  /// Cancel the timer for `key`. Returns whether one was running.
  pub fn cancel(&self, key: &str) -> bool {
    let handle = match self.tasks.lock() {
      Ok(mut tasks) => tasks.remove(key),
      Err(poisoned) => poisoned.into_inner().remove(key),
    };
    match handle {
      Some(handle) => {
        handle.abort();
        true
      }
      None => false,
    }
  }

  pub fn cancel_all(&self) {
    let handles: Vec<_> = match self.tasks.lock() {
      Ok(mut tasks) => tasks.drain().map(|(_, h)| h).collect(),
      Err(poisoned) => poisoned.into_inner().drain().map(|(_, h)| h).collect(),
    };
    for handle in handles {
      handle.abort();
    }
  }

  pub fn active(&self) -> usize {
    match self.tasks.lock() {
      Ok(tasks) => tasks.values().filter(|h| !h.is_finished()).count(),
      Err(_) => 0,
    }
  }
}

impl Drop for RefreshScheduler {
  fn drop(&mut self) {
    self.cancel_all();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn counter_tick(counter: &Arc<AtomicU32>) -> impl Fn() -> futures::future::Ready<()> {
    let counter = counter.clone();
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(())
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_ticks_periodically() {
    let scheduler = RefreshScheduler::new();
    let ticks = Arc::new(AtomicU32::new(0));
    scheduler.schedule("company", Duration::from_secs(300), counter_tick(&ticks));

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(302)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_reschedule_replaces_timer() {
    let scheduler = RefreshScheduler::new();
    let first = Arc::new(AtomicU32::new(0));
    let second = Arc::new(AtomicU32::new(0));

    scheduler.schedule("company", Duration::from_secs(10), counter_tick(&first));
    scheduler.schedule("company", Duration::from_secs(10), counter_tick(&second));
    tokio::time::sleep(Duration::from_secs(25)).await;

    assert_eq!(scheduler.active(), 1);
    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_drop_cancels_timers() {
    let ticks = Arc::new(AtomicU32::new(0));
    {
      let scheduler = RefreshScheduler::new();
      scheduler.schedule("a", Duration::from_secs(10), counter_tick(&ticks));
      scheduler.schedule("b", Duration::from_secs(10), counter_tick(&ticks));
      assert_eq!(scheduler.active(), 2);
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel() {
    let scheduler = RefreshScheduler::new();
    let ticks = Arc::new(AtomicU32::new(0));
    scheduler.schedule("a", Duration::from_secs(10), counter_tick(&ticks));

    assert!(scheduler.cancel("a"));
    assert!(!scheduler.cancel("a"));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
  }
}
