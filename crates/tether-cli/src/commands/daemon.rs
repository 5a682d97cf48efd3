//! The agent daemon: wires the channel manager to the task engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use tether_channel::{
    ChannelManager, ChannelPush, Delivery, GshellChannel, PollChannel, PushKind, WebSocketChannel,
};
use tether_plugin::PluginManager;
use tether_process::SystemRunner;
use tether_session::{SessionClient, SessionMode};
use tether_task::{HttpStatusReporter, HttpTaskFetcher, MetricsReporter, TaskEngine};
use tether_types::plugin::PluginHealth;
use tether_types::task::SessionTaskInfo;
use tether_types::AgentConfig;

/// How often the channel supervisor re-evaluates failover.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(30);

/// Run the agent until interrupted.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    info!(host = %config.host(), "tether agent starting");

    let runner = Arc::new(SystemRunner);
    let fetcher = Arc::new(HttpTaskFetcher::new(&config).context("build task fetcher")?);
    let reporter = Arc::new(HttpStatusReporter::new(&config).context("build status reporter")?);
    let engine = Arc::new(TaskEngine::new(fetcher, runner.clone()).with_reporter(reporter));
    engine.init_timer_manager();

    // Session descriptors spawn their own clients, independent of the
    // control channel.
    engine.set_session_handler(Arc::new(move |info: SessionTaskInfo| {
        tokio::spawn(run_session(info));
    }));

    // Every deduplicated push funnels into a fetch.
    let delivery = {
        let engine = engine.clone();
        Delivery::new(Arc::new(move |push: ChannelPush| {
            let engine = engine.clone();
            let from_kick = match push.kind {
                PushKind::Kick => true,
                PushKind::Poll => false,
                PushKind::Unknown => {
                    warn!(raw = %push.raw, "unrecognised push dropped");
                    return;
                }
            };
            tokio::spawn(async move {
                engine.fetch(from_kick, "", 0, false).await;
            });
        }))
    };

    let mut manager = ChannelManager::new(delivery.clone());
    match GshellChannel::new(&config, delivery.clone()) {
        Ok(gshell) => manager.register(Arc::new(gshell)),
        Err(e) => warn!(error = %e, "gshell channel unavailable"),
    }
    manager.register(Arc::new(WebSocketChannel::new(
        config.ws_push_url(),
        Duration::from_secs(config.ws_ping_interval_secs),
        delivery.clone(),
    )));
    manager.register(Arc::new(PollChannel::new(
        Duration::from_secs(config.poll_interval_secs),
        delivery,
    )));

    // Probe and start the best channel before opening the fetch gate.
    manager.init().await.context("no usable control channel")?;
    let manager = Arc::new(manager);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(manager.clone().run(SUPERVISOR_INTERVAL, shutdown_rx.clone()));

    // Plugin heartbeat: poll installed persist plugins on their smallest
    // configured interval and push the health upstream.
    match PluginManager::new(config.clone(), runner) {
        Ok(plugin_manager) => {
            let mut heartbeat_rx = shutdown_rx;
            tokio::spawn(async move {
                loop {
                    let interval = plugin_manager.heartbeat_interval();
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            let statuses = match plugin_manager.collect_status().await {
                                Ok(statuses) => statuses,
                                Err(e) => {
                                    warn!(error = %e, "plugin status collection failed");
                                    continue;
                                }
                            };
                            for status in statuses {
                                // Removal already reported its terminal state.
                                if status.status == PluginHealth::Removed {
                                    continue;
                                }
                                if let Err(e) = plugin_manager
                                    .report_status(&status.name, &status.version, status.status)
                                    .await
                                {
                                    warn!(
                                        plugin = %status.name,
                                        error = %e,
                                        "plugin heartbeat report failed"
                                    );
                                }
                            }
                        }
                        _ = heartbeat_rx.changed() => return,
                    }
                }
            });
        }
        Err(e) => warn!(error = %e, "plugin heartbeat unavailable"),
    }

    match MetricsReporter::new(&config) {
        Ok(metrics) => metrics.report("agent_start", env!("CARGO_PKG_VERSION")).await,
        Err(e) => warn!(error = %e, "metrics reporter unavailable"),
    }

    // Steady state: open the gate, then drain work queued while we were
    // down.
    engine.enable_fetching_task();
    let dispatched = engine.fetch(false, "", 0, true).await;
    info!(dispatched, "coldstart fetch complete");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    manager.shutdown().await;
    if let Some(timers) = engine.timer_manager() {
        timers.shutdown();
    }
    Ok(())
}

/// Serve one session descriptor to completion.
async fn run_session(info: SessionTaskInfo) {
    let mode = if info.port_forward {
        SessionMode::PortForward
    } else {
        SessionMode::Shell
    };
    let client = SessionClient::new(&info.websocket_url, &info.token, mode);

    let result = match mode {
        SessionMode::PortForward => {
            match tokio::net::TcpStream::connect(("127.0.0.1", info.target_port)).await {
                Ok(stream) => {
                    let (read_half, write_half) = stream.into_split();
                    client.run(read_half, write_half).await
                }
                Err(e) => {
                    warn!(
                        session_id = %info.session_id,
                        port = info.target_port,
                        error = %e,
                        "local port-forward target unreachable"
                    );
                    return;
                }
            }
        }
        SessionMode::Shell => {
            let mut child = match tokio::process::Command::new("sh")
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!(session_id = %info.session_id, error = %e, "shell spawn failed");
                    return;
                }
            };
            let stdout = child.stdout.take().expect("piped stdout");
            let stdin = child.stdin.take().expect("piped stdin");
            // Shell output streams toward the server; server input feeds
            // the shell.
            let result = client.run(stdout, stdin).await;
            let _ = child.kill().await;
            result
        }
    };

    match result {
        Ok(()) => info!(session_id = %info.session_id, "session ended"),
        Err(e) => warn!(session_id = %info.session_id, error = %e, "session failed"),
    }
}
