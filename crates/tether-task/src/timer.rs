//! One-shot and cron timers firing async callbacks.
//!
//! Each timer runs in its own tokio task and awaits its callback to
//! completion before computing the next tick, so callbacks are serial per
//! timer. Cron expressions are evaluated by the `cron` crate (6-field,
//! seconds first).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use tether_types::AgentError;

/// Handle to a registered timer.
pub type TimerId = u64;

/// Callback fired on each tick.
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct TimerHandle {
    cancel: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

/// Registry of live timers.
pub struct TimerManager {
    timers: Mutex<HashMap<TimerId, TimerHandle>>,
    next_id: AtomicU64,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.timers.lock().expect("timer map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a cron timer. The expression is validated here; a bad
    /// expression never produces a half-registered timer.
    pub fn create_cron_timer(
        &self,
        expr: &str,
        callback: TimerCallback,
    ) -> Result<TimerId, AgentError> {
        let schedule = cron::Schedule::from_str(expr)
            .map_err(|e| AgentError::Task(format!("invalid cron expression {expr:?}: {e}")))?;

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let join = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                    debug!(timer_id = id, "cron schedule exhausted");
                    return;
                };
                let wait = (next - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        callback().await;
                    }
                    _ = cancel_rx.changed() => {
                        debug!(timer_id = id, "cron timer cancelled");
                        return;
                    }
                }
            }
        });

        self.timers
            .lock()
            .expect("timer map lock poisoned")
            .insert(id, TimerHandle { cancel: cancel_tx, join });
        Ok(id)
    }

    /// Register a timer that fires once after `delay`.
    pub fn create_oneshot_timer(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let join = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    callback().await;
                }
                _ = cancel_rx.changed() => {
                    debug!(timer_id = id, "one-shot timer cancelled");
                }
            }
        });

        self.timers
            .lock()
            .expect("timer map lock poisoned")
            .insert(id, TimerHandle { cancel: cancel_tx, join });
        id
    }

    /// Stop a timer. Returns `false` if the id is unknown.
    pub fn stop_timer(&self, id: TimerId) -> bool {
        let handle = self
            .timers
            .lock()
            .expect("timer map lock poisoned")
            .remove(&id);
        match handle {
            Some(handle) => {
                if handle.cancel.send(true).is_err() {
                    // Loop already exited on its own.
                    handle.join.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Stop every timer; used at agent shutdown.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().expect("timer map lock poisoned");
        for (id, handle) in timers.drain() {
            if handle.cancel.send(true).is_err() {
                warn!(timer_id = id, "timer loop already gone at shutdown");
                handle.join.abort();
            }
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: Arc<AtomicUsize>) -> TimerCallback {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let manager = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = manager
            .create_cron_timer("not a cron line", counting_callback(counter))
            .unwrap_err();
        assert!(err.to_string().contains("invalid cron expression"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn far_future_cron_timer_registers_without_firing() {
        let manager = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        // Midnight on January 1st: does not fire during the test.
        let id = manager
            .create_cron_timer("0 0 0 1 1 *", counting_callback(counter.clone()))
            .unwrap();
        assert_eq!(manager.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(manager.stop_timer(id));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn oneshot_fires_once() {
        let manager = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.create_oneshot_timer(Duration::from_millis(10), counting_callback(counter.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_oneshot_never_fires() {
        let manager = TimerManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = manager
            .create_oneshot_timer(Duration::from_secs(60), counting_callback(counter.clone()));
        assert!(manager.stop_timer(id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_unknown_timer_returns_false() {
        let manager = TimerManager::new();
        assert!(!manager.stop_timer(999));
    }
}
