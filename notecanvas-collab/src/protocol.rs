//! Binary envelope for everything sent over a collaboration socket.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ version  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Operation traffic payloads are bincode; `Channel` payloads are the JSON
//! [`ChannelMessage`] so they can be relayed without re-encoding.
//!
//! ```text
//! client                         server
//!   │── Join {info, known} ─────────►│
//!   │◄─ Snapshot {catch_up, peers} ──│
//!   │── Submit {submission} ────────►│── sequencer
//!   │◄─ Ack {sequenced}   (author) ──│
//!   │◄─ RemoteOp {sequenced} (rest) ─│
//!   │◄─ Reject {id, reason} ─────────│   on invalid operation
//!   │◄─► Channel {json} ─────────────│   presence / locks / node updates
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelMessage;
use crate::sequencer::{CatchUp, LogPosition, Sequenced, Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client enters a document room
    Join = 1,
    /// Server state for a joining client
    Snapshot = 2,
    /// Client operation for the sequencer
    Submit = 3,
    /// Sequencer accepted the recipient's own operation
    Ack = 4,
    /// Sequencer accepted another client's operation
    RemoteOp = 5,
    /// Presence, lock or node update (JSON payload)
    Channel = 6,
    PeerJoined = 7,
    PeerLeft = 8,
    /// Sequencer refused a submission
    Reject = 9,
    Ping = 10,
    Pong = 11,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: color_for(peer_id),
        }
    }
}

/// Stable color from the low bytes of the id.
fn color_for(id: Uuid) -> [f32; 4] {
    let bytes = id.as_bytes();
    let channel = |b: u8| b as f32 / 255.0;
    [channel(bytes[15]), channel(bytes[14]), channel(bytes[13]), 1.0]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub info: PeerInfo,
    /// Last log position the client integrated, if it has one.
    pub known: Option<LogPosition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinReply {
    pub catch_up: CatchUp,
    /// Peers already in the room.
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rejection {
    pub submission_id: Uuid,
    pub reason: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender, or the subject of a peer notification. Nil for messages
    /// originating from the server itself.
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Document version the message refers to (base version for `Submit`)
    pub version: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        doc_id: Uuid,
        version: u64,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            peer_id,
            doc_id,
            version,
            payload,
        })
    }

    fn empty(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            version: 0,
            payload: Vec::new(),
        }
    }

    pub fn join(doc_id: Uuid, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::Join,
            request.info.peer_id,
            doc_id,
            request.known.map_or(0, |k| k.version),
            request,
        )
    }

    pub fn snapshot(doc_id: Uuid, reply: &JoinReply) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::Snapshot,
            Uuid::nil(),
            doc_id,
            reply.catch_up.version,
            reply,
        )
    }

    pub fn submit(doc_id: Uuid, submission: &Submission) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::Submit,
            submission.client_id,
            doc_id,
            submission.base_version,
            submission,
        )
    }

    /// A log entry as the server publishes it to the room.
    pub fn remote_op(doc_id: Uuid, entry: &Sequenced) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::RemoteOp,
            entry.client_id.unwrap_or_else(Uuid::nil),
            doc_id,
            entry.version,
            entry,
        )
    }

    /// Re-tag a `RemoteOp` for its own author. The payload is untouched.
    pub fn into_ack(mut self) -> Self {
        self.msg_type = MessageType::Ack;
        self
    }

    pub fn channel(doc_id: Uuid, msg: &ChannelMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Channel,
            peer_id: msg.user_id(),
            doc_id,
            version: 0,
            payload: msg.encode()?,
        })
    }

    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::PeerJoined, info.peer_id, doc_id, 0, info)
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::empty(MessageType::PeerLeft, peer_id, doc_id)
    }

    pub fn reject(peer_id: Uuid, doc_id: Uuid, rejection: &Rejection) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Reject, peer_id, doc_id, 0, rejection)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, peer_id, Uuid::nil())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, peer_id, Uuid::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: &[MessageType]) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.parse(&[MessageType::Join])
    }

    pub fn join_reply(&self) -> Result<JoinReply, ProtocolError> {
        self.parse(&[MessageType::Snapshot])
    }

    pub fn submission(&self) -> Result<Submission, ProtocolError> {
        self.parse(&[MessageType::Submit])
    }

    /// Payload of an `Ack` or `RemoteOp`.
    pub fn sequenced(&self) -> Result<Sequenced, ProtocolError> {
        self.parse(&[MessageType::Ack, MessageType::RemoteOp])
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.parse(&[MessageType::PeerJoined])
    }

    pub fn rejection(&self) -> Result<Rejection, ProtocolError> {
        self.parse(&[MessageType::Reject])
    }

    /// Parsed and validated channel payload.
    pub fn channel_message(&self) -> Result<ChannelMessage, ProtocolError> {
        if self.msg_type != MessageType::Channel {
            return Err(ProtocolError::InvalidMessageType);
        }
        ChannelMessage::decode(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    /// Well-formed but semantically invalid payload
    InvalidPayload(String),
    ConnectionClosed,
    Timeout,
    /// The server refused a request
    Rejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Rejected(e) => write!(f, "Rejected: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
