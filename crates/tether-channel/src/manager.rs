//! Channel selection, failover, and deduplicated delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tether_types::AgentError;

use crate::channel::{ChannelPush, ChannelState, ControlChannel, PushCallback};
use crate::dedup::DedupWindow;

/// Minimum backoff before a failed channel is reconsidered.
pub const REPROBE_BACKOFF: Duration = Duration::from_secs(30);

/// The shared delivery sink every channel pushes into.
///
/// Dedup happens here, so the engine-facing callback sees each server
/// message id at most once regardless of which channels carried it.
pub struct Delivery {
    dedup: Mutex<DedupWindow>,
    on_recv: PushCallback,
}

impl Delivery {
    pub fn new(on_recv: PushCallback) -> Arc<Self> {
        Arc::new(Self {
            dedup: Mutex::new(DedupWindow::default()),
            on_recv,
        })
    }

    /// Hand a push to the agent unless it is a duplicate.
    pub fn deliver(&self, push: ChannelPush) {
        let fresh = self
            .dedup
            .lock()
            .expect("dedup window lock poisoned")
            .insert(&push.msg_id);
        if fresh {
            (self.on_recv)(push);
        } else {
            debug!(msg_id = %push.msg_id, "duplicate push suppressed");
        }
    }
}

/// Supervises the ordered candidate set and keeps one channel active.
pub struct ChannelManager {
    channels: Vec<Arc<dyn ControlChannel>>,
    delivery: Arc<Delivery>,
    /// Name of the channel currently considered active.
    active: Mutex<Option<&'static str>>,
    /// When each channel last failed, for the reprobe backoff.
    failed_at: Mutex<HashMap<&'static str, Instant>>,
    reprobe_backoff: Duration,
}

impl ChannelManager {
    pub fn new(delivery: Arc<Delivery>) -> Self {
        Self {
            channels: Vec::new(),
            delivery,
            active: Mutex::new(None),
            failed_at: Mutex::new(HashMap::new()),
            reprobe_backoff: REPROBE_BACKOFF,
        }
    }

    /// Shorten the reprobe backoff; tests use this to stay fast.
    pub fn with_reprobe_backoff(mut self, backoff: Duration) -> Self {
        self.reprobe_backoff = backoff;
        self
    }

    /// Add a candidate. Candidates are sorted by priority on `init`.
    pub fn register(&mut self, channel: Arc<dyn ControlChannel>) {
        self.channels.push(channel);
    }

    pub fn delivery(&self) -> &Arc<Delivery> {
        &self.delivery
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn active_channel(&self) -> Option<&'static str> {
        *self.active.lock().expect("active slot lock poisoned")
    }

    /// Probe all candidates and start the best supported one.
    pub async fn init(&mut self) -> Result<(), AgentError> {
        self.channels.sort_by_key(|c| c.priority());

        for channel in &self.channels {
            if !channel.is_supported().await {
                debug!(channel = channel.name(), "channel unsupported on this host");
                continue;
            }
            match channel.start_channel().await {
                Ok(()) => {
                    info!(channel = channel.name(), "control channel active");
                    *self.active.lock().expect("active slot lock poisoned") =
                        Some(channel.name());
                    return Ok(());
                }
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "channel failed to start");
                    self.mark_failed(channel.name());
                }
            }
        }
        Err(AgentError::Channel(
            "no control channel could be started".into(),
        ))
    }

    fn mark_failed(&self, name: &'static str) {
        self.failed_at
            .lock()
            .expect("failure table lock poisoned")
            .insert(name, Instant::now());
    }

    fn in_backoff(&self, name: &'static str) -> bool {
        self.failed_at
            .lock()
            .expect("failure table lock poisoned")
            .get(name)
            .map(|at| at.elapsed() < self.reprobe_backoff)
            .unwrap_or(false)
    }

    /// One supervision pass: if the active channel has failed (or nothing
    /// is active), promote the next supported candidate outside its
    /// backoff window.
    pub async fn tick(&self) {
        let active = self.active_channel();
        if let Some(name) = active {
            if let Some(channel) = self.channels.iter().find(|c| c.name() == name) {
                match channel.state() {
                    ChannelState::Failed => {
                        warn!(channel = name, "active channel failed, promoting fallback");
                        self.mark_failed(name);
                    }
                    ChannelState::Stopped | ChannelState::Idle => {
                        debug!(channel = name, "active channel gone quiet");
                    }
                    _ => return,
                }
            }
        }

        for channel in &self.channels {
            if self.in_backoff(channel.name()) {
                continue;
            }
            if matches!(channel.state(), ChannelState::Active) {
                *self.active.lock().expect("active slot lock poisoned") =
                    Some(channel.name());
                return;
            }
            if !channel.is_supported().await {
                continue;
            }
            match channel.start_channel().await {
                Ok(()) => {
                    info!(channel = channel.name(), "promoted to active channel");
                    *self.active.lock().expect("active slot lock poisoned") =
                        Some(channel.name());
                    return;
                }
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "promotion failed");
                    self.mark_failed(channel.name());
                }
            }
        }
        *self.active.lock().expect("active slot lock poisoned") = None;
    }

    /// Ask the active channel to step down voluntarily, then re-select.
    pub async fn switch_active(&self) {
        if let Some(name) = self.active_channel() {
            if let Some(channel) = self.channels.iter().find(|c| c.name() == name) {
                if let Err(e) = channel.switch_channel().await {
                    warn!(channel = name, error = %e, "voluntary switch failed");
                }
            }
            // The demoted channel sits out one backoff window so the next
            // candidate actually takes over.
            self.mark_failed(name);
        }
        *self.active.lock().expect("active slot lock poisoned") = None;
        self.tick().await;
    }

    /// Stop every channel; used at agent shutdown.
    pub async fn shutdown(&self) {
        for channel in &self.channels {
            channel.stop_channel().await;
        }
        *self.active.lock().expect("active slot lock poisoned") = None;
    }

    /// Drive supervision until cancelled.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.tick().await,
                _ = cancel.changed() => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PushKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scriptable fake transport.
    struct FakeChannel {
        name: &'static str,
        priority: u8,
        supported: bool,
        fail_start: bool,
        state: Mutex<ChannelState>,
        starts: AtomicUsize,
    }

    impl FakeChannel {
        fn new(name: &'static str, priority: u8, supported: bool, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                supported,
                fail_start,
                state: Mutex::new(ChannelState::Idle),
                starts: AtomicUsize::new(0),
            })
        }

        fn force_state(&self, state: ChannelState) {
            *self.state.lock().unwrap() = state;
        }
    }

    #[async_trait]
    impl ControlChannel for FakeChannel {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn state(&self) -> ChannelState {
            *self.state.lock().unwrap()
        }

        async fn is_supported(&self) -> bool {
            self.supported
        }

        async fn start_channel(&self) -> Result<(), AgentError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                *self.state.lock().unwrap() = ChannelState::Failed;
                return Err(AgentError::Channel("scripted failure".into()));
            }
            *self.state.lock().unwrap() = ChannelState::Active;
            Ok(())
        }

        async fn stop_channel(&self) {
            *self.state.lock().unwrap() = ChannelState::Stopped;
        }

        async fn switch_channel(&self) -> Result<(), AgentError> {
            *self.state.lock().unwrap() = ChannelState::Idle;
            Ok(())
        }
    }

    fn delivery_counting(counter: Arc<AtomicUsize>) -> Arc<Delivery> {
        Delivery::new(Arc::new(move |_push| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    fn push(id: &str) -> ChannelPush {
        ChannelPush {
            msg_id: id.into(),
            kind: PushKind::Kick,
            raw: id.into(),
        }
    }

    #[tokio::test]
    async fn init_picks_highest_priority_supported_channel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = ChannelManager::new(delivery_counting(counter));

        let gshell = FakeChannel::new("gshell", 0, false, false);
        let websocket = FakeChannel::new("websocket", 1, true, false);
        let poll = FakeChannel::new("poll", 2, true, false);
        manager.register(poll.clone());
        manager.register(gshell.clone());
        manager.register(websocket.clone());

        manager.init().await.unwrap();
        assert_eq!(manager.active_channel(), Some("websocket"));
        // Unsupported channel was never started; lower-priority fallback
        // was not needed.
        assert_eq!(gshell.starts.load(Ordering::SeqCst), 0);
        assert_eq!(poll.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn init_falls_through_failing_channels() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = ChannelManager::new(delivery_counting(counter));

        let websocket = FakeChannel::new("websocket", 1, true, true);
        let poll = FakeChannel::new("poll", 2, true, false);
        manager.register(websocket.clone());
        manager.register(poll.clone());

        manager.init().await.unwrap();
        assert_eq!(manager.active_channel(), Some("poll"));
        assert_eq!(websocket.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn init_errors_when_nothing_starts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = ChannelManager::new(delivery_counting(counter));
        manager.register(FakeChannel::new("websocket", 1, true, true));

        assert!(manager.init().await.is_err());
        assert_eq!(manager.active_channel(), None);
    }

    #[tokio::test]
    async fn failed_active_channel_is_demoted_on_tick() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = ChannelManager::new(delivery_counting(counter))
            .with_reprobe_backoff(Duration::from_secs(3600));

        let websocket = FakeChannel::new("websocket", 1, true, false);
        let poll = FakeChannel::new("poll", 2, true, false);
        manager.register(websocket.clone());
        manager.register(poll.clone());

        manager.init().await.unwrap();
        assert_eq!(manager.active_channel(), Some("websocket"));

        websocket.force_state(ChannelState::Failed);
        manager.tick().await;
        assert_eq!(manager.active_channel(), Some("poll"));

        // Within the backoff window the failed channel stays demoted even
        // though it has the better priority.
        poll.force_state(ChannelState::Failed);
        manager.tick().await;
        assert_ne!(manager.active_channel(), Some("websocket"));
    }

    #[tokio::test]
    async fn reprobe_happens_after_backoff() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = ChannelManager::new(delivery_counting(counter))
            .with_reprobe_backoff(Duration::from_millis(1));

        let websocket = FakeChannel::new("websocket", 1, true, false);
        let poll = FakeChannel::new("poll", 2, true, false);
        manager.register(websocket.clone());
        manager.register(poll.clone());

        manager.init().await.unwrap();
        websocket.force_state(ChannelState::Failed);
        manager.tick().await;
        assert_eq!(manager.active_channel(), Some("poll"));

        // After the (tiny) backoff the better channel is reconsidered.
        tokio::time::sleep(Duration::from_millis(10)).await;
        websocket.force_state(ChannelState::Idle);
        poll.force_state(ChannelState::Failed);
        manager.tick().await;
        assert_eq!(manager.active_channel(), Some("websocket"));
    }

    #[tokio::test]
    async fn delivery_suppresses_duplicates_across_channels() {
        let counter = Arc::new(AtomicUsize::new(0));
        let delivery = delivery_counting(counter.clone());

        // The same server message arriving over two channels during
        // failover reaches the engine once.
        delivery.deliver(push("m-1"));
        delivery.deliver(push("m-1"));
        delivery.deliver(push("m-2"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn switch_active_promotes_next_channel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut manager = ChannelManager::new(delivery_counting(counter));

        let websocket = FakeChannel::new("websocket", 1, true, false);
        let poll = FakeChannel::new("poll", 2, true, false);
        manager.register(websocket.clone());
        manager.register(poll.clone());

        manager.init().await.unwrap();
        manager.switch_active().await;
        // The demoted channel went Idle; the fallback is promoted.
        assert_eq!(manager.active_channel(), Some("poll"));
    }
}
