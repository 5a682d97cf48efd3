//! Virtio-serial ("gshell") channel.
//!
//! Feasibility is established by a server round-trip: the agent posts to
//! `/luban/api/gshell` and the response says whether the hypervisor side
//! is wired up. When it is, pushes arrive as lines on a virtio-serial port
//! with no network path involved.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tether_types::{AgentConfig, AgentError};

use crate::channel::{ChannelPush, ChannelState, ControlChannel};
use crate::manager::Delivery;

/// Default virtio-serial port the hypervisor exposes.
pub const DEFAULT_GSHELL_PORT: &str = "/dev/virtio-ports/org.qemu.guest_agent.1";

/// Delay between feasibility-probe attempts.
const PROBE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Response of the gshell feasibility probe.
#[derive(Debug, Clone, Deserialize)]
pub struct GshellStatus {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "GshellSupport", default)]
    pub gshell_support: String,
    #[serde(rename = "InstanceID", default)]
    pub instance_id: String,
    #[serde(rename = "RequestID", default)]
    pub request_id: String,
    /// How many reattempts the server allows.
    #[serde(rename = "Retry", default)]
    pub retry: u32,
}

struct Inner {
    probe_url: String,
    device_path: PathBuf,
    /// Where the probed instance id is persisted for hybrid registration.
    instance_id_path: PathBuf,
    client: reqwest::Client,
    delivery: Arc<Delivery>,
    state: Mutex<ChannelState>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    probe_retry_delay: Duration,
}

impl Inner {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().expect("channel state lock poisoned") = state;
    }

    /// One probe round-trip.
    async fn probe_once(&self) -> Result<GshellStatus, AgentError> {
        let response = self
            .client
            .post(&self.probe_url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| AgentError::Http(format!("gshell probe: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Http(format!("gshell probe returned {status}")));
        }
        response
            .json::<GshellStatus>()
            .await
            .map_err(|e| AgentError::Http(format!("decode gshell probe: {e}")))
    }

    /// Probe with the server-bounded retry budget.
    async fn probe(&self) -> Result<GshellStatus, AgentError> {
        let mut status = self.probe_once().await?;
        let mut remaining = status.retry;
        while status.gshell_support != "true" && remaining > 0 {
            debug!(remaining, "gshell not ready yet, reprobing");
            tokio::time::sleep(self.probe_retry_delay).await;
            status = self.probe_once().await?;
            remaining -= 1;
        }

        // The probe is what tells a hybrid registration its instance id;
        // persist it for the rest of the agent.
        if !status.instance_id.is_empty() {
            if let Some(parent) = self.instance_id_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&self.instance_id_path, &status.instance_id) {
                warn!(
                    path = %self.instance_id_path.display(),
                    error = %e,
                    "could not persist instance id"
                );
            }
        }
        Ok(status)
    }

    /// Read pushes off the virtio-serial port until cancelled.
    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let file = match tokio::fs::File::open(&self.device_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.device_path.display(), error = %e, "gshell port open failed");
                self.set_state(ChannelState::Failed);
                return;
            }
        };
        self.set_state(ChannelState::Active);
        info!(path = %self.device_path.display(), "gshell channel active");

        let mut lines = BufReader::new(file).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(text)) => {
                        if !text.trim().is_empty() {
                            self.delivery.deliver(ChannelPush::parse(&text));
                        }
                    }
                    Ok(None) => {
                        warn!("gshell port reached EOF");
                        self.set_state(ChannelState::Failed);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "gshell port read error");
                        self.set_state(ChannelState::Failed);
                        return;
                    }
                },
                _ = cancel.changed() => {
                    self.set_state(ChannelState::Stopped);
                    return;
                }
            }
        }
    }
}

/// Host-push transport over a virtio-serial port.
pub struct GshellChannel {
    inner: Arc<Inner>,
}

impl GshellChannel {
    pub fn new(config: &AgentConfig, delivery: Arc<Delivery>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| AgentError::Http(format!("build http client: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                probe_url: config.gshell_url(),
                device_path: PathBuf::from(DEFAULT_GSHELL_PORT),
                instance_id_path: config.instance_id_path(),
                client,
                delivery,
                state: Mutex::new(ChannelState::Idle),
                cancel: Mutex::new(None),
                probe_retry_delay: PROBE_RETRY_DELAY,
            }),
        })
    }

    /// Point the channel at a different serial port (tests use a fifo or a
    /// plain file here).
    pub fn with_device_path(mut self, path: impl Into<PathBuf>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_device_path must be called before the channel is shared");
        inner.device_path = path.into();
        self
    }

    /// Shorten the probe retry delay; tests use this to stay fast.
    pub fn with_probe_retry_delay(mut self, delay: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_probe_retry_delay must be called before the channel is shared");
        inner.probe_retry_delay = delay;
        self
    }

    /// Run the feasibility probe; exposed for the test path.
    pub async fn probe(&self) -> Result<GshellStatus, AgentError> {
        self.inner.probe().await
    }
}

#[async_trait]
impl ControlChannel for GshellChannel {
    fn name(&self) -> &'static str {
        "gshell"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn state(&self) -> ChannelState {
        *self.inner.state.lock().expect("channel state lock poisoned")
    }

    async fn is_supported(&self) -> bool {
        if !self.inner.device_path.exists() {
            return false;
        }
        match self.inner.probe().await {
            Ok(status) => status.gshell_support == "true",
            Err(e) => {
                debug!(error = %e, "gshell probe failed");
                false
            }
        }
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
    }

    /// Test path: re-run the probe, then step down.
    async fn switch_channel(&self) -> Result<(), AgentError> {
        let status = self.inner.probe().await?;
        info!(
            support = %status.gshell_support,
            instance_id = %status.instance_id,
            "gshell switch probe"
        );
        self.stop_channel().await;
        self.inner.set_state(ChannelState::Idle);
        Ok(())
    }
}
