//! Task descriptors fetched from the control plane.
//!
//! A fetch round-trip returns one [`TaskBatch`] partitioned by category;
//! each entry is a [`RunTaskInfo`] (run/stop/test), a [`SendFileTaskInfo`],
//! or a [`SessionTaskInfo`].

use std::collections::HashMap;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

/// Why a fetch was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchReason {
    /// Server push told the agent to fetch immediately.
    Kick,
    /// Periodic poll or boot-time fetch.
    Routine,
}

impl std::fmt::Display for FetchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchReason::Kick => write!(f, "kick"),
            FetchReason::Routine => write!(f, "routine"),
        }
    }
}

/// Repeat policy of a task descriptor.
///
/// The wire value is a string; anything other than `"Once"` or `"Cron"`
/// deserializes to [`RepeatMode::Unknown`] so a malformed descriptor is
/// rejected at dispatch rather than at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RepeatMode {
    #[default]
    Once,
    Cron,
    Unknown,
}

impl<'de> Deserialize<'de> for RepeatMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "Once" => RepeatMode::Once,
            "Cron" => RepeatMode::Cron,
            _ => RepeatMode::Unknown,
        })
    }
}

/// Category tag routing a descriptor to its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskCategory {
    #[default]
    Run,
    Stop,
    Test,
    SendFile,
    Session,
}

/// A task descriptor delivered by the control plane.
///
/// Invariant: `repeat == Cron` iff `cron_expr` is non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunTaskInfo {
    /// Task id, unique per tenancy.
    pub task_id: String,
    /// Command text to execute.
    pub command: String,
    /// Interpreter / command type (e.g. "RunShellScript").
    pub command_type: String,
    /// Working directory for the child process.
    pub working_dir: String,
    /// Execution timeout in seconds.
    pub timeout_secs: u64,
    /// Environment injected into the child process.
    pub env: HashMap<String, String>,
    /// Repeat policy.
    pub repeat: RepeatMode,
    /// Cron expression, set when `repeat == Cron`.
    pub cron_expr: String,
    /// Whether this descriptor came from a boot-time (coldstart) fetch.
    pub coldstart: bool,
    /// Dispatcher category.
    pub category: TaskCategory,
}

impl RunTaskInfo {
    /// Check the repeat/cron invariant.
    pub fn cron_consistent(&self) -> bool {
        (self.repeat == RepeatMode::Cron) == !self.cron_expr.is_empty()
    }
}

/// Descriptor for a file push from the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendFileTaskInfo {
    pub task_id: String,
    /// Destination path on the instance.
    pub destination: String,
    /// Base64 file content.
    pub content: String,
    /// Octal permission string, e.g. "0644".
    pub mode: String,
    pub owner: String,
    pub group: String,
    pub overwrite: bool,
    pub timeout_secs: u64,
}

/// Descriptor for an interactive session requested by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionTaskInfo {
    pub session_id: String,
    /// Web-socket endpoint the session client should dial.
    pub websocket_url: String,
    /// Session token presented in the `x-acs-session-token` header.
    pub token: String,
    /// `true` for a port-forward session, `false` for a shell.
    pub port_forward: bool,
    /// Target port for port-forward sessions.
    pub target_port: u16,
}

/// One fetch round-trip worth of work, partitioned by category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskBatch {
    pub run: Vec<RunTaskInfo>,
    pub stop: Vec<RunTaskInfo>,
    pub test: Vec<RunTaskInfo>,
    pub send_file: Vec<SendFileTaskInfo>,
    pub session: Vec<SessionTaskInfo>,
}

impl TaskBatch {
    /// Total number of dispatchable items in the batch.
    pub fn len(&self) -> usize {
        self.run.len() + self.stop.len() + self.test.len() + self.send_file.len()
            + self.session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
