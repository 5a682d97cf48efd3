//! The transport trait and the push message it delivers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use tether_types::AgentError;

/// Lifecycle of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Starting,
    Active,
    Failed,
    Stopped,
}

/// What a server push asks the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Fetch immediately.
    Kick,
    /// Routine poll tick (synthesised by the poll channel).
    Poll,
    /// Unrecognised instruction; logged and dropped by the receiver.
    Unknown,
}

/// One push delivered through a channel.
#[derive(Debug, Clone)]
pub struct ChannelPush {
    /// Server-provided message id; the dedup window keys on it.
    pub msg_id: String,
    pub kind: PushKind,
    /// Raw text as received, for logging.
    pub raw: String,
}

impl ChannelPush {
    /// Parse a wire push. The server sends a small JSON object; a bare
    /// string is treated as a kick keyed by its own text.
    pub fn parse(raw: &str) -> Self {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire {
            #[serde(default)]
            msg_id: String,
            #[serde(default, rename = "type")]
            kind: String,
        }

        if let Ok(wire) = serde_json::from_str::<Wire>(raw) {
            let kind = match wire.kind.as_str() {
                "kick" => PushKind::Kick,
                _ => PushKind::Unknown,
            };
            let msg_id = if wire.msg_id.is_empty() {
                raw.to_string()
            } else {
                wire.msg_id
            };
            return Self {
                msg_id,
                kind,
                raw: raw.to_string(),
            };
        }

        Self {
            msg_id: raw.to_string(),
            kind: if raw.trim() == "kick" {
                PushKind::Kick
            } else {
                PushKind::Unknown
            },
            raw: raw.to_string(),
        }
    }
}

/// Callback the manager hands a deduplicated push to.
pub type PushCallback = Arc<dyn Fn(ChannelPush) + Send + Sync>;

/// One candidate transport.
///
/// Channels deliver pushes through the shared [`crate::Delivery`] sink they
/// were constructed with; the manager only drives their lifecycle.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower value wins during selection.
    fn priority(&self) -> u8;

    fn state(&self) -> ChannelState;

    /// Whether this transport can work on this host right now.
    async fn is_supported(&self) -> bool;

    async fn start_channel(&self) -> Result<(), AgentError>;

    async fn stop_channel(&self);

    /// Voluntary demotion hook, used during drain and by the gshell test
    /// path.
    async fn switch_channel(&self) -> Result<(), AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_kick() {
        let push = ChannelPush::parse(r#"{"msgId": "m-17", "type": "kick"}"#);
        assert_eq!(push.kind, PushKind::Kick);
        assert_eq!(push.msg_id, "m-17");
    }

    #[test]
    fn parse_json_without_id_falls_back_to_raw() {
        let raw = r#"{"type": "kick"}"#;
        let push = ChannelPush::parse(raw);
        assert_eq!(push.kind, PushKind::Kick);
        assert_eq!(push.msg_id, raw);
    }

    #[test]
    fn parse_bare_kick() {
        let push = ChannelPush::parse("kick");
        assert_eq!(push.kind, PushKind::Kick);
    }

    #[test]
    fn parse_unknown_instruction() {
        let push = ChannelPush::parse(r#"{"msgId": "m-1", "type": "dance"}"#);
        assert_eq!(push.kind, PushKind::Unknown);
        let push = ChannelPush::parse("gibberish");
        assert_eq!(push.kind, PushKind::Unknown);
    }
}
