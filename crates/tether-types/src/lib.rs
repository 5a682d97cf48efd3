//! Shared data model for the tether fleet agent.
//!
//! Everything the subsystem crates exchange lives here: task descriptors,
//! plugin records, the plugin-manager exit-code taxonomy, agent
//! configuration, and the shared error type.

pub mod config;
pub mod error;
pub mod exit;
pub mod plugin;
pub mod task;

pub use config::AgentConfig;
pub use error::AgentError;
pub use exit::ExitCode;
