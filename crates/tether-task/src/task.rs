//! A single task invocation: lifecycle, execution, cancellation.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use tether_process::{CommandSpec, ProcessRunner, RunOutcome};
use tether_types::task::{RepeatMode, RunTaskInfo};
use tether_types::AgentError;

/// Lifecycle of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Cancelling,
    Done,
}

/// One task instance owning its descriptor and cancellation handle.
///
/// Created on first dispatch; destroyed (removed from the factory) when its
/// repeat policy cannot fire again.
pub struct Task {
    info: RunTaskInfo,
    state: Mutex<TaskState>,
    cancel_tx: watch::Sender<bool>,
}

impl Task {
    pub fn new(info: RunTaskInfo) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            info,
            state: Mutex::new(TaskState::Pending),
            cancel_tx,
        }
    }

    pub fn info(&self) -> &RunTaskInfo {
        &self.info
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("task state lock poisoned")
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock().expect("task state lock poisoned") = state;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Request cancellation. Idempotent; unblocks an in-flight run.
    pub fn cancel(&self) {
        let state = self.state();
        if state == TaskState::Running {
            self.set_state(TaskState::Cancelling);
        }
        // Repeated sends are harmless; receivers only observe the flip.
        let _ = self.cancel_tx.send(true);
        debug!(task_id = %self.info.task_id, "task cancellation requested");
    }

    /// Validate the descriptor without executing the command body.
    pub fn pre_check(&self) -> Result<(), AgentError> {
        if self.info.task_id.is_empty() {
            return Err(AgentError::Task("empty task id".into()));
        }
        interpreter_for(&self.info.command_type, &self.info.command)?;
        if !self.info.cron_consistent() {
            return Err(AgentError::Task(format!(
                "task {}: repeat mode and cron expression disagree",
                self.info.task_id
            )));
        }
        if self.info.repeat == RepeatMode::Unknown {
            return Err(AgentError::Task(format!(
                "task {}: unknown repeat mode",
                self.info.task_id
            )));
        }
        Ok(())
    }

    /// Run the command to completion through the injected runner.
    ///
    /// Cancellation (via [`Task::cancel`]) is threaded into the runner,
    /// which kills the whole process group and reaps it before the run
    /// returns.
    pub async fn run(&self, runner: &dyn ProcessRunner) -> Result<RunOutcome, AgentError> {
        if self.is_cancelled() {
            return Err(AgentError::Task(format!(
                "task {} already cancelled",
                self.info.task_id
            )));
        }
        self.set_state(TaskState::Running);

        let (program, args) = interpreter_for(&self.info.command_type, &self.info.command)?;
        let mut spec = CommandSpec::new(program)
            .args(args)
            .timeout(Duration::from_secs(self.info.timeout_secs))
            .cancel(self.cancel_tx.subscribe());
        for (key, value) in &self.info.env {
            spec = spec.env(key.clone(), value.clone());
        }
        if !self.info.working_dir.is_empty() {
            spec = spec.working_dir(&self.info.working_dir);
        }

        let result = runner.run(spec).await;
        self.set_state(TaskState::Done);

        if result.is_err() && self.is_cancelled() {
            warn!(task_id = %self.info.task_id, "task cancelled mid-run");
            return Err(AgentError::Task(format!(
                "task {} cancelled",
                self.info.task_id
            )));
        }
        if let Ok(outcome) = &result {
            info!(
                task_id = %self.info.task_id,
                exit_code = outcome.exit_code,
                status = ?outcome.status,
                "task finished"
            );
        }
        result
    }
}

/// Map a descriptor command type onto an interpreter invocation.
fn interpreter_for(
    command_type: &str,
    command: &str,
) -> Result<(String, Vec<String>), AgentError> {
    match command_type {
        "" | "RunShellScript" => Ok(("sh".into(), vec!["-c".into(), command.into()])),
        "RunPythonScript" => Ok(("python3".into(), vec!["-c".into(), command.into()])),
        other => Err(AgentError::Task(format!("unknown command type {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_process::SystemRunner;
    use tether_types::task::RepeatMode;

    fn shell_task(id: &str, command: &str) -> Task {
        Task::new(RunTaskInfo {
            task_id: id.into(),
            command: command.into(),
            command_type: "RunShellScript".into(),
            timeout_secs: 10,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn run_executes_and_reaches_done() {
        let task = shell_task("t-run", "exit 0");
        assert_eq!(task.state(), TaskState::Pending);
        let outcome = task.run(&SystemRunner).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(task.state(), TaskState::Done);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_blocks_future_runs() {
        let task = shell_task("t-cancel", "sleep 30");
        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());

        let err = task.run(&SystemRunner).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn cancel_unblocks_in_flight_run() {
        let task = std::sync::Arc::new(shell_task("t-inflight", "sleep 30"));
        let runner_task = {
            let task = task.clone();
            tokio::spawn(async move { task.run(&SystemRunner).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.state(), TaskState::Running);

        task.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), runner_task)
            .await
            .expect("cancel must unblock the run")
            .unwrap();
        assert!(result.is_err());
        assert_eq!(task.state(), TaskState::Done);
    }

    #[test]
    fn pre_check_never_runs_the_body() {
        // A command that would fail if executed passes the precheck.
        let task = shell_task("t-pre", "exit 12");
        task.pre_check().unwrap();
    }

    #[test]
    fn pre_check_rejects_bad_descriptors() {
        let mut info = RunTaskInfo {
            task_id: "t-bad".into(),
            command_type: "RunJavaScript".into(),
            ..Default::default()
        };
        assert!(Task::new(info.clone()).pre_check().is_err());

        info.command_type = "RunShellScript".into();
        info.repeat = RepeatMode::Unknown;
        assert!(Task::new(info.clone()).pre_check().is_err());

        info.repeat = RepeatMode::Cron;
        // Cron without an expression violates the invariant.
        assert!(Task::new(info).pre_check().is_err());
    }
}
