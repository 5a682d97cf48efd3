//! Child-process execution with timeout, cancellation, and process-group
//! kill.
//!
//! The runner spawns the child in its own process group (unix) so that a
//! timeout or an external cancellation can take down the whole tree, not
//! just the direct child. Both paths go through the same group-kill; the
//! outcome carries the raw exit code plus a three-way classification the
//! task and plugin layers translate into their own code sets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use tether_types::AgentError;

/// Three-way classification of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Child exited zero.
    Success,
    /// Child exited non-zero or died on a signal.
    Fail,
    /// Child exceeded the timeout and its process group was killed.
    Timeout,
}

/// Result of a completed (or killed) run.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// Raw exit code; `-1` when the child was killed or left no code.
    pub exit_code: i32,
    pub status: RunStatus,
}

/// What to spawn and how.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Zero means no timeout.
    pub timeout: Duration,
    /// Discard child stdio instead of inheriting the agent's.
    pub quiet: bool,
    /// When this flips to `true` mid-run, the process group is killed and
    /// the run ends with an error.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Attach a cancellation signal; see [`CommandSpec::cancel`].
    pub fn cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Seam for spawning child processes; swapped for a fake in tests.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the command to completion (or timeout/cancellation) and
    /// classify the result.
    async fn run(&self, spec: CommandSpec) -> Result<RunOutcome, AgentError>;
}

/// How a wait on the child ended.
enum WaitEnd {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// The real runner backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> Result<RunOutcome, AgentError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        if spec.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        // Detach into a fresh process group so a timeout or cancel kill
        // reaches the child's own descendants too.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Process(format!("spawn {}: {e}", spec.program)))?;
        let pid = child.id();
        debug!(program = %spec.program, pid, "child spawned");

        let timeout = spec.timeout;
        let mut cancel_rx = spec.cancel.clone();

        let end = {
            let wait = child.wait();
            tokio::pin!(wait);

            let deadline = async {
                if timeout.is_zero() {
                    std::future::pending::<()>().await
                } else {
                    tokio::time::sleep(timeout).await
                }
            };
            tokio::pin!(deadline);

            let cancelled = async {
                match cancel_rx.as_mut() {
                    Some(rx) => loop {
                        if *rx.borrow() {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            // Sender gone without cancelling: never fires.
                            std::future::pending::<()>().await;
                        }
                    },
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(cancelled);

            tokio::select! {
                waited = &mut wait => WaitEnd::Exited(waited),
                _ = &mut deadline => WaitEnd::TimedOut,
                _ = &mut cancelled => WaitEnd::Cancelled,
            }
        };

        match end {
            WaitEnd::Exited(waited) => {
                let status = waited
                    .map_err(|e| AgentError::Process(format!("wait {}: {e}", spec.program)))?;
                let exit_code = status.code().unwrap_or(-1);
                let classified = if status.success() {
                    RunStatus::Success
                } else {
                    RunStatus::Fail
                };
                Ok(RunOutcome {
                    exit_code,
                    status: classified,
                })
            }
            WaitEnd::TimedOut => {
                warn!(
                    program = %spec.program,
                    timeout_secs = timeout.as_secs(),
                    "child exceeded timeout, killing process group"
                );
                kill_group(&mut child, pid).await;
                Ok(RunOutcome {
                    exit_code: -1,
                    status: RunStatus::Timeout,
                })
            }
            WaitEnd::Cancelled => {
                warn!(program = %spec.program, "run cancelled, killing process group");
                kill_group(&mut child, pid).await;
                Err(AgentError::Process(format!(
                    "{} cancelled, process group killed",
                    spec.program
                )))
            }
        }
    }
}

/// Kill the child's process group, falling back to killing the child alone,
/// then reap it.
async fn kill_group(child: &mut tokio::process::Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "killpg failed, killing child directly");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        warn!(error = %e, "kill child failed");
    }
    let _ = child.wait().await;
}
