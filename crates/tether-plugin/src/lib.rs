//! Plugin lifecycle for the tether agent.
//!
//! Plugins are opaque executables shipped as zip packages with a
//! `config.json` at the top. The registry persists the installed set as a
//! single JSON file; the manager installs, upgrades, executes, removes,
//! verifies, and reports status.

pub mod catalog;
pub mod manager;
pub mod registry;
pub mod version;

pub use catalog::PluginCatalog;
pub use manager::{OpError, PluginManager};
pub use registry::PluginRegistry;
