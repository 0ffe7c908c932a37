//! Signaling protocol messages
//!
//! Messages travel as JSON text frames using the PeerJS field names:
//!
//! ```json
//! { "type": "OFFER", "src": "pl-…", "dst": "pl-…", "payload": { "sdp": "…" } }
//! ```
//!
//! The payload is kept as raw JSON and relayed byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};

use crate::error::ErrorCode;

/// Message type tag
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Sent by the server once a peer is admitted
    Open,
    /// Peer is leaving (to `dst`, or to the server when `dst` is absent)
    Leave,
    Candidate,
    Offer,
    Answer,
    /// A relayed message could not be delivered in time
    Expire,
    /// Keepalive, consumed by the server
    Heartbeat,
    /// Requested id is already registered
    IdTaken,
    Error,
    /// Any other tag, relayed untouched
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Open => "OPEN",
            MessageType::Leave => "LEAVE",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Offer => "OFFER",
            MessageType::Answer => "ANSWER",
            MessageType::Expire => "EXPIRE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::IdTaken => "ID-TAKEN",
            MessageType::Error => "ERROR",
            MessageType::Custom(tag) => tag,
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "OPEN" => MessageType::Open,
            "LEAVE" => MessageType::Leave,
            "CANDIDATE" => MessageType::Candidate,
            "OFFER" => MessageType::Offer,
            "ANSWER" => MessageType::Answer,
            "EXPIRE" => MessageType::Expire,
            "HEARTBEAT" => MessageType::Heartbeat,
            "ID-TAKEN" => MessageType::IdTaken,
            "ERROR" => MessageType::Error,
            _ => MessageType::Custom(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope exchanged between peers through the relay
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Sender id, stamped by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// Destination id; absent for control messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,

    /// Opaque payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

/// Payload of server-generated ERROR and ID-TAKEN messages
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub msg: String,
    /// Peer the failed operation concerned, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

impl SignalingMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            src: None,
            dst: None,
            payload: None,
        }
    }

    /// Admission confirmation
    pub fn open() -> Self {
        Self::new(MessageType::Open)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat)
    }

    /// The requested id is taken
    pub fn id_taken(id: &str) -> Self {
        let mut msg = Self::new(MessageType::IdTaken);
        msg.payload = error_payload(ErrorCode::IdTaken, "ID is taken", Some(id));
        msg
    }

    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Error);
        msg.payload = error_payload(code, &message.into(), None);
        msg
    }

    /// Error about an operation that concerned another peer
    pub fn peer_error(code: ErrorCode, message: impl Into<String>, peer: &str) -> Self {
        let mut msg = Self::new(MessageType::Error);
        msg.payload = error_payload(code, &message.into(), Some(peer));
        msg
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_dst(mut self, dst: impl Into<String>) -> Self {
        self.dst = Some(dst.into());
        self
    }

    /// Attach a raw JSON payload. Fails if `json` is not valid JSON.
    pub fn with_raw_payload(mut self, json: impl Into<String>) -> Result<Self, serde_json::Error> {
        self.payload = Some(RawValue::from_string(json.into())?);
        Ok(self)
    }

    /// Raw payload text, exactly as received
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }

    /// Decode the payload of a server-generated error
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        self.payload_str()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Control messages have no destination and are consumed by the server
    pub fn is_control(&self) -> bool {
        self.dst.is_none()
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn error_payload(code: ErrorCode, msg: &str, peer: Option<&str>) -> Option<Box<RawValue>> {
    to_raw_value(&ErrorPayload {
        code,
        msg: msg.to_string(),
        peer: peer.map(str::to_string),
    })
    .ok()
}
