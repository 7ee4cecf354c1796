//! JSON wire protocol for session connections.
//!
//! Every frame is a text message with an envelope:
//! ```text
//! { "type": "<message type>", "payload": { ... } }
//! ```
//!
//! Inbound (client → server): `layout.update`, `ping`.
//! Outbound (server → client): `layout.snapshot`, `layout.updated`,
//! `layout.conflict`, `presence.updated`, `error`, `pong`.
//!
//! Inbound parsing goes through [`Envelope`] first so that an unknown type
//! or malformed payload can be reported back as a client error without
//! tearing down the connection.

use serde::{Deserialize, Serialize};

use crate::store::LayoutDocument;

/// Error codes carried in outbound `error` messages.
pub mod error_code {
    /// Role lacks edit capability for the attempted operation.
    pub const FORBIDDEN: &str = "FORBIDDEN";
    /// Inbound frame could not be parsed into a known message.
    pub const BAD_MESSAGE: &str = "BAD_MESSAGE";
    /// Connection token failed verification.
    pub const INVALID_WS_TOKEN: &str = "INVALID_WS_TOKEN";
    /// Session unknown or caller is not a member of it.
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    /// Server-side failure while handling an otherwise valid request.
    pub const INTERNAL: &str = "INTERNAL";
}

/// Close reasons, each with a distinct close code so clients can tell
/// them apart without parsing free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Token failed verification (bad signature, expired, wrong class).
    InvalidToken,
    /// Valid session token, but scoped to a different session.
    SessionMismatch,
    /// Token verified, but the user is not a member of the session.
    NotAMember,
    /// Normal closure.
    Normal,
}

impl CloseReason {
    /// WebSocket close code (4xxx range for application rejections).
    pub fn code(self) -> u16 {
        match self {
            CloseReason::InvalidToken => 4401,
            CloseReason::SessionMismatch => 4403,
            CloseReason::NotAMember => 4404,
            CloseReason::Normal => 1000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::InvalidToken => "invalid token",
            CloseReason::SessionMismatch => "session mismatch",
            CloseReason::NotAMember => "not a member of session",
            CloseReason::Normal => "normal closure",
        }
    }
}

/// Raw message envelope; `payload` stays untyped until the type is known.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of an inbound `layout.update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutUpdate {
    /// Version the client based its edit on.
    pub base_version: u64,
    pub document: LayoutDocument,
}

/// Inbound messages accepted on an active connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    LayoutUpdate(LayoutUpdate),
    Ping,
}

impl ClientMessage {
    /// Parse a raw text frame into a typed message.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        match envelope.kind.as_str() {
            "layout.update" => {
                let update = serde_json::from_value(envelope.payload)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(ClientMessage::LayoutUpdate(update))
            }
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Serialize to the envelope form (used by the client half).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = match self {
            ClientMessage::LayoutUpdate(update) => serde_json::json!({
                "type": "layout.update",
                "payload": update,
            }),
            ClientMessage::Ping => serde_json::json!({ "type": "ping" }),
        };
        serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Outbound messages, serialized with the same `type`/`payload` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// Authoritative state sent to a connection right after it activates.
    #[serde(rename = "layout.snapshot")]
    Snapshot { version: u64, document: LayoutDocument },

    /// A publish succeeded; fanned out to the whole session.
    #[serde(rename = "layout.updated", rename_all = "camelCase")]
    Updated {
        version: u64,
        document: LayoutDocument,
        published_by: String,
    },

    /// Sent privately to a proposer whose base version went stale; carries
    /// the authoritative state to rebase against.
    #[serde(rename = "layout.conflict")]
    Conflict { version: u64, document: LayoutDocument },

    /// Membership count changed.
    #[serde(rename = "presence.updated", rename_all = "camelCase")]
    Presence { participant_count: usize },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Malformed(String),
    UnknownType(String),
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed message: {e}"),
            ProtocolError::UnknownType(t) => write!(f, "unknown message type: {t}"),
            ProtocolError::Serialization(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
