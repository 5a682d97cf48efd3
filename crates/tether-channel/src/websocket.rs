//! Long-lived websocket channel with application-level pings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tether_types::AgentError;

use crate::channel::{ChannelPush, ChannelState, ControlChannel};
use crate::manager::Delivery;

/// Consecutive reconnect failures before the channel declares itself dead.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay between reconnect attempts; doubled per failure.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

struct Inner {
    url: String,
    delivery: Arc<Delivery>,
    ping_interval_secs: AtomicU64,
    state: Mutex<ChannelState>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

impl Inner {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().expect("channel state lock poisoned") = state;
    }

    /// Connection loop: connect, pump frames, reconnect on drop.
    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut attempts = 0u32;

        'reconnect: loop {
            if *cancel.borrow() {
                self.set_state(ChannelState::Stopped);
                return;
            }

            let (stream, _) = match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok(ok) => ok,
                Err(e) => {
                    attempts += 1;
                    warn!(url = %self.url, attempt = attempts, error = %e, "websocket connect failed");
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        self.set_state(ChannelState::Failed);
                        return;
                    }
                    let delay = RECONNECT_BASE_DELAY * 2u32.saturating_pow(attempts - 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'reconnect,
                        _ = cancel.changed() => {
                            self.set_state(ChannelState::Stopped);
                            return;
                        }
                    }
                }
            };

            info!(url = %self.url, "websocket channel connected");
            attempts = 0;
            self.set_state(ChannelState::Active);
            let (mut sink, mut source) = stream.split();
            let mut ping = tokio::time::interval(Duration::from_secs(
                self.ping_interval_secs.load(Ordering::SeqCst),
            ));
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; swallow it.
            ping.tick().await;

            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.delivery.deliver(ChannelPush::parse(&text));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("websocket closed by server, reconnecting");
                            self.set_state(ChannelState::Starting);
                            continue 'reconnect;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket receive error, reconnecting");
                            self.set_state(ChannelState::Starting);
                            continue 'reconnect;
                        }
                    },
                    _ = ping.tick() => {
                        if sink.send(Message::Ping(b"keepalive".to_vec())).await.is_err() {
                            warn!("websocket ping failed, reconnecting");
                            self.set_state(ChannelState::Starting);
                            continue 'reconnect;
                        }
                    }
                    _ = cancel.changed() => {
                        let _ = sink.send(Message::Close(None)).await;
                        self.set_state(ChannelState::Stopped);
                        return;
                    }
                }
            }
        }
    }
}

/// Websocket transport for server pushes.
pub struct WebSocketChannel {
    inner: Arc<Inner>,
}

impl WebSocketChannel {
    pub fn new(url: impl Into<String>, ping_interval: Duration, delivery: Arc<Delivery>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                delivery,
                ping_interval_secs: AtomicU64::new(ping_interval.as_secs().max(1)),
                state: Mutex::new(ChannelState::Idle),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Adjust the application-level ping cadence. Takes effect on the next
    /// (re)connect.
    pub fn start_pings(&self, interval: Duration) {
        self.inner
            .ping_interval_secs
            .store(interval.as_secs().max(1), Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlChannel for WebSocketChannel {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn state(&self) -> ChannelState {
        *self.inner.state.lock().expect("channel state lock poisoned")
    }

    async fn is_supported(&self) -> bool {
        !self.inner.url.is_empty()
    }

    async fn start_channel(&self) -> Result<(), AgentError> {
        if self.inner.url.is_empty() {
            return Err(AgentError::Channel(
                "no websocket endpoint configured".into(),
            ));
        }
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
        debug!("websocket channel stopped");
    }

    async fn switch_channel(&self) -> Result<(), AgentError> {
        self.stop_channel().await;
        self.inner.set_state(ChannelState::Idle);
        Ok(())
    }
}
