//! Binary session frames.
//!
//! Wire layout, big-endian throughout:
//!
//! ```text
//! message_type   u8
//! version_len    u8
//! version        UTF-8 bytes ("1.01")
//! created_date   u64   milliseconds since epoch
//! sequence       i64   monotonic per direction
//! payload_len    u32
//! payload        bytes
//! ```

use tether_types::AgentError;

/// Schema version stamped on every outbound frame.
pub const SCHEMA_VERSION: &str = "1.01";

/// Status-byte vocabulary carried in `StatusDataChannel` payloads.
pub mod status {
    /// Peer could not establish the backing connection; fatal.
    pub const CONNECT_FAILED: u8 = 2;
    /// Keep-alive, ignored.
    pub const KEEPALIVE: u8 = 3;
    /// Peer closed the session; fatal.
    pub const PEER_CLOSED: u8 = 5;
}

/// Frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    InputStreamData = 1,
    OutputStreamData = 2,
    SetSize = 3,
    StatusDataChannel = 4,
    CloseDataChannel = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = AgentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::InputStreamData,
            2 => MessageType::OutputStreamData,
            3 => MessageType::SetSize,
            4 => MessageType::StatusDataChannel,
            5 => MessageType::CloseDataChannel,
            other => {
                return Err(AgentError::Session(format!(
                    "unknown session message type {other}"
                )))
            }
        })
    }
}

/// One session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub message_type: MessageType,
    pub schema_version: String,
    /// Milliseconds since epoch.
    pub created_date: u64,
    pub sequence_number: i64,
    pub payload: Vec<u8>,
}

impl SessionMessage {
    /// Build a frame stamped with the current time.
    pub fn new(message_type: MessageType, sequence_number: i64, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            schema_version: SCHEMA_VERSION.to_string(),
            created_date: chrono::Utc::now().timestamp_millis() as u64,
            sequence_number,
            payload,
        }
    }

    /// Encode to the wire layout.
    pub fn serialize(&self) -> Vec<u8> {
        let version = self.schema_version.as_bytes();
        let mut buf =
            Vec::with_capacity(1 + 1 + version.len() + 8 + 8 + 4 + self.payload.len());
        buf.push(self.message_type as u8);
        buf.push(version.len() as u8);
        buf.extend_from_slice(version);
        buf.extend_from_slice(&self.created_date.to_be_bytes());
        buf.extend_from_slice(&self.sequence_number.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from the wire layout with bounds checking.
    pub fn deserialize(data: &[u8]) -> Result<Self, AgentError> {
        let mut reader = Reader::new(data);
        let message_type = MessageType::try_from(reader.u8()?)?;
        let version_len = reader.u8()? as usize;
        let schema_version = String::from_utf8(reader.bytes(version_len)?.to_vec())
            .map_err(|e| AgentError::Session(format!("frame version not UTF-8: {e}")))?;
        let created_date = reader.u64()?;
        let sequence_number = reader.i64()?;
        let payload_len = reader.u32()? as usize;
        let payload = reader.bytes(payload_len)?.to_vec();

        Ok(Self {
            message_type,
            schema_version,
            created_date,
            sequence_number,
            payload,
        })
    }

    /// Sanity-check a decoded frame before acting on it.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.schema_version.is_empty() {
            return Err(AgentError::Session("frame missing schema version".into()));
        }
        if self.sequence_number < 0 {
            return Err(AgentError::Session(format!(
                "negative sequence number {}",
                self.sequence_number
            )));
        }
        Ok(())
    }
}

/// Bounds-checked big-endian reader over a frame buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], AgentError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| AgentError::Session("truncated session frame".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, AgentError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, AgentError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, AgentError> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> Result<i64, AgentError> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_survives_the_wire() {
        let msg = SessionMessage::new(MessageType::InputStreamData, 7, b"ls -la\n".to_vec());
        let decoded = SessionMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.schema_version, "1.01");
        decoded.validate().unwrap();
    }

    #[test]
    fn empty_payload_is_legal() {
        let msg = SessionMessage::new(MessageType::CloseDataChannel, 0, Vec::new());
        let decoded = SessionMessage::deserialize(&msg.serialize()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let full = SessionMessage::new(MessageType::OutputStreamData, 3, b"hello".to_vec())
            .serialize();
        for cut in [0, 1, 5, full.len() - 1] {
            let err = SessionMessage::deserialize(&full[..cut]).unwrap_err();
            assert!(
                err.to_string().contains("truncated")
                    || err.to_string().contains("unknown"),
                "cut at {cut}: {err}"
            );
        }
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut raw = SessionMessage::new(MessageType::SetSize, 1, Vec::new()).serialize();
        raw[0] = 99;
        assert!(SessionMessage::deserialize(&raw).is_err());
    }

    #[test]
    fn payload_length_larger_than_buffer_is_rejected() {
        let mut raw = SessionMessage::new(MessageType::OutputStreamData, 1, b"ab".to_vec())
            .serialize();
        // Inflate the declared payload length past the buffer end.
        let len_offset = raw.len() - 2 - 4;
        raw[len_offset..len_offset + 4].copy_from_slice(&100u32.to_be_bytes());
        assert!(SessionMessage::deserialize(&raw).is_err());
    }

    #[test]
    fn validate_rejects_bad_frames() {
        let mut msg = SessionMessage::new(MessageType::OutputStreamData, 1, Vec::new());
        msg.schema_version.clear();
        assert!(msg.validate().is_err());

        let mut msg = SessionMessage::new(MessageType::OutputStreamData, 1, Vec::new());
        msg.sequence_number = -4;
        assert!(msg.validate().is_err());
    }
}
