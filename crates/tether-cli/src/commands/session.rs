//! Interactive session command: attach the local terminal to a session
//! endpoint.

use anyhow::Context;
use tracing::info;

use tether_session::{SessionClient, SessionMode};

pub async fn run(url: String, token: String, port_forward: bool) -> anyhow::Result<()> {
    let mode = if port_forward {
        SessionMode::PortForward
    } else {
        SessionMode::Shell
    };
    info!(%url, ?mode, "opening session");

    let client = SessionClient::new(url, token, mode);
    client
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("session terminated abnormally")?;
    Ok(())
}
