//! Fallback long-poll channel.
//!
//! Always supported: when neither websocket nor gshell can carry pushes,
//! the agent synthesises a routine tick on a fixed interval and the task
//! engine polls the server itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use tether_types::AgentError;

use crate::channel::{ChannelPush, ChannelState, ControlChannel, PushKind};
use crate::manager::Delivery;

struct Inner {
    interval: Duration,
    delivery: Arc<Delivery>,
    state: Mutex<ChannelState>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    /// Tick counter; gives every synthetic push a distinct id.
    ticks: AtomicU64,
}

impl Inner {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().expect("channel state lock poisoned") = state;
    }

    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        self.set_state(ChannelState::Active);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
                    self.delivery.deliver(ChannelPush {
                        msg_id: format!("poll-{tick}"),
                        kind: PushKind::Poll,
                        raw: String::new(),
                    });
                }
                _ = cancel.changed() => {
                    self.set_state(ChannelState::Stopped);
                    return;
                }
            }
        }
    }
}

/// Periodic poll tick generator, the channel of last resort.
pub struct PollChannel {
    inner: Arc<Inner>,
}

impl PollChannel {
    pub fn new(interval: Duration, delivery: Arc<Delivery>) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                delivery,
                state: Mutex::new(ChannelState::Idle),
                cancel: Mutex::new(None),
                ticks: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl ControlChannel for PollChannel {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn state(&self) -> ChannelState {
        *self.inner.state.lock().expect("channel state lock poisoned")
    }

    async fn is_supported(&self) -> bool {
        true
    }

    async fn start_channel(&self) -> Result<(), AgentError> {
        self.inner.set_state(ChannelState::Starting);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self
            .inner
            .cancel
            .lock()
            .expect("cancel slot lock poisoned") = Some(cancel_tx);
        tokio::spawn(Arc::clone(&self.inner).run(cancel_rx));
        Ok(())
    }

    async fn stop_channel(&self) {
        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .expect("cancel slot lock poisoned")
            .take()
        {
            let _ = cancel.send(true);
        }
        self.inner.set_state(ChannelState::Stopped);
        debug!("poll channel stopped");
    }

    async fn switch_channel(&self) -> Result<(), AgentError> {
        self.stop_channel().await;
        self.inner.set_state(ChannelState::Idle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_channel_is_always_supported() {
        let delivery = Delivery::new(Arc::new(|_| {}));
        let channel = PollChannel::new(Duration::from_secs(1800), delivery);
        assert!(channel.is_supported().await);
    }

    #[tokio::test]
    async fn ticks_arrive_with_distinct_ids() {
        let pushes = Arc::new(Mutex::new(Vec::new()));
        let sink = pushes.clone();
        let delivery = Delivery::new(Arc::new(move |push: ChannelPush| {
            sink.lock().unwrap().push(push);
        }));
        let channel = PollChannel::new(Duration::from_millis(10), delivery);
        channel.start_channel().await.unwrap();

        for _ in 0..100 {
            if pushes.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        channel.stop_channel().await;

        let received = pushes.lock().unwrap();
        assert!(received.len() >= 2, "expected at least two poll ticks");
        assert_eq!(received[0].kind, PushKind::Poll);
        assert_ne!(received[0].msg_id, received[1].msg_id);
    }
}
