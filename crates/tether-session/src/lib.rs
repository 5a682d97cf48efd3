//! Interactive sessions tunnelled over a web-socket.
//!
//! One [`client::SessionClient`] owns one connection and serves either an
//! interactive shell (terminal raw mode, resize propagation) or an opaque
//! port-forward byte stream. Frames are the fixed-schema binary messages
//! in [`message`]; teardown is arbitrated by a close-once poison channel.

pub mod client;
pub mod message;

pub use client::{SessionClient, SessionMode};
pub use message::{MessageType, SessionMessage, SCHEMA_VERSION};
