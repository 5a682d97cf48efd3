//! Error types shared across all tether crates.

/// Errors that can occur across the tether agent.
///
/// Each variant corresponds to a subsystem: configuration, control-plane
/// HTTP, control channels, the task engine, interactive sessions, the
/// plugin registry, or process execution.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Control-plane HTTP round-trip failure.
    #[error("control plane request failed: {0}")]
    Http(String),

    /// Control-channel transport failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// Task engine failure.
    #[error("task engine error: {0}")]
    Task(String),

    /// A task with this id is already registered in the factory.
    #[error("task {0} already registered")]
    TaskExists(String),

    /// A lookup by task id found nothing.
    #[error("task {0} not found")]
    TaskNotFound(String),

    /// The timer manager has not been initialised.
    #[error("timer manager not initialised")]
    TimerUninitialized,

    /// Interactive session failure.
    #[error("session error: {0}")]
    Session(String),

    /// Plugin registry or lifecycle failure.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Child-process spawn or wait failure.
    #[error("process error: {0}")]
    Process(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            AgentError::Config("missing region".into()).to_string(),
            "configuration error: missing region"
        );
        assert_eq!(
            AgentError::TaskExists("t-123".into()).to_string(),
            "task t-123 already registered"
        );
        assert_eq!(
            AgentError::TimerUninitialized.to_string(),
            "timer manager not initialised"
        );
        assert_eq!(
            AgentError::Process("spawn failed".into()).to_string(),
            "process error: spawn failed"
        );
    }
}
