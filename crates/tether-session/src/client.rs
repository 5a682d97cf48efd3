//! The streaming session client.
//!
//! Three cooperating loops (read, write, termsize) share one web-socket.
//! Any loop that hits a fatal condition poisons the shared watch channel
//! and every loop, plus [`SessionClient::run`] itself, unwinds. Poisoning
//! is idempotent, so simultaneous deaths are safe.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tether_types::AgentError;

use crate::message::{status, MessageType, SessionMessage};

/// Grace period before a port-forward stream counts as connected.
const PORT_FORWARD_GRACE: Duration = Duration::from_secs(2);

/// What kind of stream this client carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Interactive shell: terminal raw mode, resize propagation.
    Shell,
    /// Opaque byte stream to a forwarded port.
    PortForward,
}

/// Serialises outbound frames behind one mutex and stamps monotonic
/// sequence numbers starting at 0.
pub struct FrameSender<S> {
    sink: S,
    seq: i64,
}

impl<S> FrameSender<S>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    pub fn new(sink: S) -> Self {
        Self { sink, seq: 0 }
    }

    /// Send one frame; returns the sequence number it carried.
    pub async fn send(
        &mut self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<i64, AgentError> {
        let frame = SessionMessage::new(message_type, self.seq, payload);
        self.sink
            .send(Message::Binary(frame.serialize()))
            .await
            .map_err(|e| AgentError::Session(format!("send frame: {e}")))?;
        let seq = self.seq;
        self.seq += 1;
        Ok(seq)
    }
}

/// Restores the terminal when the session ends, however it ends.
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        // Only touch the terminal when we actually own one.
        if std::io::stdout().is_terminal() {
            if let Err(e) = crossterm::terminal::enable_raw_mode() {
                warn!(error = %e, "could not enable raw mode");
                return Self { enabled: false };
            }
            return Self { enabled: true };
        }
        Self { enabled: false }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// One interactive session over one web-socket.
pub struct SessionClient {
    url: String,
    token: String,
    mode: SessionMode,
    poison: watch::Sender<bool>,
    real_connected: Arc<AtomicBool>,
}

impl SessionClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>, mode: SessionMode) -> Self {
        let (poison, _) = watch::channel(false);
        Self {
            url: url.into(),
            token: token.into(),
            mode,
            poison,
            real_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal every loop to terminate. Safe to call from any number of
    /// callers concurrently; only the first flip matters.
    pub fn poison(&self) {
        let _ = self.poison.send(true);
    }

    /// Whether the first peer data (or the port-forward grace) arrived.
    pub fn real_connected(&self) -> bool {
        self.real_connected.load(Ordering::SeqCst)
    }

    /// Dial the server, pump the stream, and block until the session ends.
    ///
    /// The terminal (shell mode) is restored before this returns.
    pub async fn run<I, O>(&self, input: I, output: O) -> Result<(), AgentError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Session(format!("bad session url: {e}")))?;
        request.headers_mut().insert(
            "x-acs-session-token",
            self.token
                .parse()
                .map_err(|_| AgentError::Session("token is not a legal header value".into()))?,
        );

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AgentError::Session(format!("session connect: {e}")))?;
        info!(url = %self.url, mode = ?self.mode, "session connected");

        let (sink, source) = stream.split();
        let sender = Arc::new(Mutex::new(FrameSender::new(sink)));

        let raw_guard = match self.mode {
            SessionMode::Shell => Some(RawModeGuard::enable()),
            SessionMode::PortForward => None,
        };

        tokio::spawn(read_loop(
            source,
            output,
            self.real_connected.clone(),
            self.poison.clone(),
        ));
        tokio::spawn(write_loop(
            input,
            sender.clone(),
            self.real_connected.clone(),
            self.poison.clone(),
            self.mode,
        ));
        if self.mode == SessionMode::Shell {
            spawn_termsize_loop(sender.clone(), self.poison.clone());
        }
        if self.mode == SessionMode::PortForward {
            // The agent needs a moment to build the local connection; after
            // the grace window we assume it is there.
            let real_connected = self.real_connected.clone();
            let mut poison_rx = self.poison.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(PORT_FORWARD_GRACE) => {
                        real_connected.store(true, Ordering::SeqCst);
                    }
                    _ = poison_rx.changed() => {}
                }
            });
        }

        // Block until somebody poisons the well.
        let mut poison_rx = self.poison.subscribe();
        while !*poison_rx.borrow() {
            if poison_rx.changed().await.is_err() {
                break;
            }
        }
        drop(raw_guard);
        debug!("session loop exiting");
        Ok(())
    }
}

/// Interpret a status payload. `Ok` means carry on; `Err` is fatal.
///
/// Code 3 is a keep-alive; everything else tears the session down.
pub async fn handle_status_payload<O>(payload: &[u8], output: &mut O) -> Result<(), AgentError>
where
    O: AsyncWrite + Unpin,
{
    let Some(&code) = payload.first() else {
        return Err(AgentError::Session("empty status payload".into()));
    };
    match code {
        status::KEEPALIVE => Ok(()),
        status::CONNECT_FAILED => {
            let _ = output.write_all(payload).await;
            let _ = output.flush().await;
            Err(AgentError::Session("peer failed to connect (status 2)".into()))
        }
        status::PEER_CLOSED => {
            let _ = output.write_all(b"session closed").await;
            let _ = output.flush().await;
            Err(AgentError::Session("peer closed the session (status 5)".into()))
        }
        other => Err(AgentError::Session(format!(
            "unexpected session status {other}"
        ))),
    }
}

/// Read frames, route by type, poison on anything fatal.
async fn read_loop<S, E, O>(
    mut source: S,
    mut output: O,
    real_connected: Arc<AtomicBool>,
    poison: watch::Sender<bool>,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
    O: AsyncWrite + Unpin,
{
    let mut poison_rx = poison.subscribe();
    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let msg = match SessionMessage::deserialize(&data) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "undecodable session frame");
                            let _ = poison.send(true);
                            return;
                        }
                    };
                    if let Err(e) = msg.validate() {
                        warn!(error = %e, "invalid session frame");
                        let _ = poison.send(true);
                        return;
                    }
                    match msg.message_type {
                        MessageType::OutputStreamData => {
                            real_connected.store(true, Ordering::SeqCst);
                            if output.write_all(&msg.payload).await.is_err() {
                                let _ = poison.send(true);
                                return;
                            }
                            let _ = output.flush().await;
                        }
                        MessageType::StatusDataChannel => {
                            if let Err(e) = handle_status_payload(&msg.payload, &mut output).await {
                                warn!(error = %e, "fatal session status");
                                let _ = poison.send(true);
                                return;
                            }
                        }
                        MessageType::CloseDataChannel => {
                            debug!("peer requested close");
                            let _ = poison.send(true);
                            return;
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("web-socket closed");
                    let _ = poison.send(true);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "session receive error");
                    let _ = poison.send(true);
                    return;
                }
            },
            _ = poison_rx.changed() => return,
        }
    }
}

/// Read user input and forward it as `InputStreamData` frames.
///
/// Until the peer is really connected the first read is buffered; it is
/// replayed ahead of the next read once the flag flips.
async fn write_loop<I, S>(
    mut input: I,
    sender: Arc<Mutex<FrameSender<S>>>,
    real_connected: Arc<AtomicBool>,
    poison: watch::Sender<bool>,
    mode: SessionMode,
) where
    I: AsyncRead + Unpin,
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut buf = [0u8; 2048];
    let mut held_back: Option<Vec<u8>> = None;
    let mut poison_rx = poison.subscribe();

    loop {
        tokio::select! {
            read = input.read(&mut buf) => match read {
                Ok(0) => {
                    // EOF: tell the peer, then die.
                    let close = match mode {
                        SessionMode::PortForward => {
                            debug!("local stream closed, sending close frame");
                            sender
                                .lock()
                                .await
                                .send(MessageType::CloseDataChannel, b"1".to_vec())
                                .await
                        }
                        SessionMode::Shell => {
                            // EOT, the terminal translation of Ctrl-D.
                            sender
                                .lock()
                                .await
                                .send(MessageType::InputStreamData, vec![0x04])
                                .await
                        }
                    };
                    if let Err(e) = close {
                        warn!(error = %e, "close frame failed");
                    }
                    let _ = poison.send(true);
                    return;
                }
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    if real_connected.load(Ordering::SeqCst) {
                        if let Some(stored) = held_back.take() {
                            debug!(bytes = stored.len(), "replaying buffered input");
                            if send_input(&sender, stored).await.is_err() {
                                let _ = poison.send(true);
                                return;
                            }
                        }
                        if send_input(&sender, data).await.is_err() {
                            let _ = poison.send(true);
                            return;
                        }
                    } else if held_back.is_none() {
                        debug!(bytes = data.len(), "peer not ready, buffering input");
                        held_back = Some(data);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "input read failed");
                    let _ = poison.send(true);
                    return;
                }
            },
            _ = poison_rx.changed() => return,
        }
    }
}

async fn send_input<S>(
    sender: &Arc<Mutex<FrameSender<S>>>,
    data: Vec<u8>,
) -> Result<i64, AgentError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    if data.is_empty() {
        return Ok(-1);
    }
    sender
        .lock()
        .await
        .send(MessageType::InputStreamData, data)
        .await
}

/// Emit `SetSize` frames on terminal resize (SIGWINCH).
#[cfg(unix)]
fn spawn_termsize_loop<S>(sender: Arc<Mutex<FrameSender<S>>>, poison: watch::Sender<bool>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        let mut winch =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "SIGWINCH unavailable, no resize propagation");
                    return;
                }
            };
        let mut poison_rx = poison.subscribe();

        loop {
            if let Ok((cols, rows)) = crossterm::terminal::size() {
                let payload = serde_json::json!({"cols": cols, "rows": rows});
                let sent = sender
                    .lock()
                    .await
                    .send(MessageType::SetSize, payload.to_string().into_bytes())
                    .await;
                if let Err(e) = sent {
                    warn!(error = %e, "resize frame failed");
                    let _ = poison.send(true);
                    return;
                }
            }
            tokio::select! {
                _ = winch.recv() => {}
                _ = poison_rx.changed() => return,
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_termsize_loop<S>(_sender: Arc<Mutex<FrameSender<S>>>, _poison: watch::Sender<bool>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
}
