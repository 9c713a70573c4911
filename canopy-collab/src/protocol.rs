//! Wire protocol between sync clients and the relay.
//!
//! Control traffic travels as JSON text frames:
//! ```text
//! {"type":"update","docId":"…","update":[…]}
//! {"type":"query-snapshot","docId":"…"}
//! {"type":"ephemeral","docId":"…","ephemeral":[…]}
//! ```
//! Payloads at or above the binary threshold switch to a bincode-encoded
//! binary frame instead, which avoids the JSON number-array blow-up:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ kind     │ doc_id   │ payload  │
//! │ 1 byte   │ 16 bytes │ variable │
//! └──────────┴──────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Payloads of this many bytes or more go out as binary frames.
pub const DEFAULT_BINARY_THRESHOLD: usize = 4 * 1024;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Envelope {
    /// Opaque replica delta.
    Update { doc_id: Uuid, update: Vec<u8> },
    /// Ask for the full document state.
    QuerySnapshot { doc_id: Uuid },
    /// Full document state, the answer to `query-snapshot`.
    Snapshot { doc_id: Uuid, snapshot: Vec<u8> },
    /// Encoded presence entries of one peer.
    Ephemeral { doc_id: Uuid, ephemeral: Vec<u8> },
    /// Ask for every peer's cached presence.
    QueryEphemeral { doc_id: Uuid },
    Ping,
    Pong,
}

impl Envelope {
    pub fn update(doc_id: Uuid, update: Vec<u8>) -> Self {
        Self::Update { doc_id, update }
    }

    pub fn ephemeral(doc_id: Uuid, ephemeral: Vec<u8>) -> Self {
        Self::Ephemeral { doc_id, ephemeral }
    }

    /// Document this message belongs to. `None` for heartbeats.
    pub fn doc_id(&self) -> Option<Uuid> {
        match self {
            Self::Update { doc_id, .. }
            | Self::QuerySnapshot { doc_id }
            | Self::Snapshot { doc_id, .. }
            | Self::Ephemeral { doc_id, .. }
            | Self::QueryEphemeral { doc_id } => Some(*doc_id),
            Self::Ping | Self::Pong => None,
        }
    }

    /// Size of the bulk payload, zero for control messages.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Update { update: p, .. }
            | Self::Snapshot { snapshot: p, .. }
            | Self::Ephemeral { ephemeral: p, .. } => p.len(),
            _ => 0,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Binary encoding, only available for payload-carrying messages.
    pub fn to_binary(&self) -> Result<Vec<u8>, ProtocolError> {
        let frame = match self {
            Self::Update { doc_id, update } => BinaryFrame::new(FrameKind::Update, *doc_id, update),
            Self::Snapshot { doc_id, snapshot } => {
                BinaryFrame::new(FrameKind::Snapshot, *doc_id, snapshot)
            }
            Self::Ephemeral { doc_id, ephemeral } => {
                BinaryFrame::new(FrameKind::Ephemeral, *doc_id, ephemeral)
            }
            _ => return Err(ProtocolError::InvalidMessageType),
        };
        bincode::serde::encode_to_vec(&frame, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _): (BinaryFrame, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame.into_envelope())
    }

    /// Pick the frame type by payload size.
    pub fn encode(&self, binary_threshold: usize) -> Result<Frame, ProtocolError> {
        if self.payload_len() > 0 && self.payload_len() >= binary_threshold {
            self.to_binary().map(Frame::Binary)
        } else {
            self.to_json().map(Frame::Text)
        }
    }
}

/// An encoded message ready for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn decode(&self) -> Result<Envelope, ProtocolError> {
        match self {
            Self::Text(text) => Envelope::from_json(text),
            Self::Binary(bytes) => Envelope::from_binary(bytes),
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
enum FrameKind {
    Update = 1,
    Snapshot = 2,
    Ephemeral = 3,
}

/// Binary frames use a plain struct; bincode cannot read tagged enums.
#[derive(Debug, Serialize, Deserialize)]
struct BinaryFrame {
    kind: FrameKind,
    doc_id: Uuid,
    payload: Vec<u8>,
}

impl BinaryFrame {
    fn new(kind: FrameKind, doc_id: Uuid, payload: &[u8]) -> Self {
        Self {
            kind,
            doc_id,
            payload: payload.to_vec(),
        }
    }

    fn into_envelope(self) -> Envelope {
        let Self {
            kind,
            doc_id,
            payload,
        } = self;
        match kind {
            FrameKind::Update => Envelope::Update {
                doc_id,
                update: payload,
            },
            FrameKind::Snapshot => Envelope::Snapshot {
                doc_id,
                snapshot: payload,
            },
            FrameKind::Ephemeral => Envelope::Ephemeral {
                doc_id,
                ephemeral: payload,
            },
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_json_shape() {
        let doc = Uuid::nil();
        let text = Envelope::update(doc, vec![1, 2]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "update", "docId": doc.to_string(), "update": [1, 2]})
        );
    }

    #[test]
    fn test_control_message_names() {
        let doc = Uuid::new_v4();
        let cases = [
            (Envelope::QuerySnapshot { doc_id: doc }, "query-snapshot"),
            (Envelope::QueryEphemeral { doc_id: doc }, "query-ephemeral"),
            (Envelope::Ping, "ping"),
            (Envelope::Pong, "pong"),
        ];
        for (envelope, name) in cases {
            let value: serde_json::Value =
                serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
            assert_eq!(value["type"], name);
            assert_eq!(Envelope::from_json(&envelope.to_json().unwrap()).unwrap(), envelope);
        }
    }

    #[test]
    fn test_parses_foreign_json() {
        let doc = Uuid::new_v4();
        let text = format!(r#"{{"docId":"{doc}","ephemeral":[7],"type":"ephemeral"}}"#);
        assert_eq!(
            Envelope::from_json(&text).unwrap(),
            Envelope::ephemeral(doc, vec![7])
        );
    }

    #[test]
    fn test_binary_frame_for_large_payload() {
        let doc = Uuid::new_v4();
        let envelope = Envelope::Snapshot {
            doc_id: doc,
            snapshot: vec![42u8; 65536],
        };
        let frame = envelope.encode(DEFAULT_BINARY_THRESHOLD).unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
        // Header overhead stays small.
        assert!(frame.len() < 65536 + 32);
        assert_eq!(frame.decode().unwrap(), envelope);
    }

    #[test]
    fn test_small_payload_stays_text() {
        let envelope = Envelope::update(Uuid::new_v4(), vec![1, 2, 3]);
        let frame = envelope.encode(DEFAULT_BINARY_THRESHOLD).unwrap();
        assert!(matches!(frame, Frame::Text(_)));
        assert_eq!(frame.decode().unwrap(), envelope);
    }

    #[test]
    fn test_control_messages_have_no_binary_form() {
        assert_eq!(
            Envelope::Ping.to_binary(),
            Err(ProtocolError::InvalidMessageType)
        );
        // Even with a zero threshold they go out as text.
        assert!(matches!(Envelope::Ping.encode(0).unwrap(), Frame::Text(_)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Envelope::from_binary(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Envelope::from_json("{\"type\":\"nope\"}").is_err());
        assert!(Envelope::from_json("not json").is_err());
    }

    #[test]
    fn test_doc_id_accessor() {
        let doc = Uuid::new_v4();
        assert_eq!(Envelope::QuerySnapshot { doc_id: doc }.doc_id(), Some(doc));
        assert_eq!(Envelope::Pong.doc_id(), None);
    }
}
