//! Control channels: how server pushes reach the agent.
//!
//! The manager owns an ordered set of candidate transports (websocket,
//! gshell virtio-serial, long-poll fallback), starts the best supported
//! one, and fails over when the active transport goes quiet. All channels
//! deliver through one deduplicating sink, so a push is never handed to
//! the task engine twice even while two channels overlap during failover.

pub mod channel;
pub mod dedup;
pub mod gshell;
pub mod manager;
pub mod poll;
pub mod websocket;

pub use channel::{ChannelPush, ChannelState, ControlChannel, PushCallback, PushKind};
pub use gshell::GshellChannel;
pub use manager::{ChannelManager, Delivery};
pub use poll::PollChannel;
pub use websocket::WebSocketChannel;
