//! Envelope: the wire message exchanged over the realtime socket.
//!
//! ARCHITECTURE
//! ============
//! Every frame on the socket is one JSON envelope:
//! `{ "type": ..., "payload": ..., "timestamp": <ms>, "messageId": ... }`.
//! The payload is a tagged union keyed by `type`.
//!
//! DESIGN
//! ======
//! Decoding is two-phase: the raw envelope is parsed first, then the payload
//! is validated against the schema for its type. Any mismatch becomes a
//! [`ProtocolError`] for that frame only; callers never see a half-decoded
//! envelope.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::models::{Message, MessageStatus, PresenceStatus};

// =============================================================================
// TYPES
// =============================================================================

/// Discriminant of an envelope. Used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Heartbeat,
    MessageSent,
    MessageReceived,
    MessageStatusUpdate,
    TypingStart,
    TypingStop,
    PresenceUpdate,
}

impl EnvelopeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::MessageSent => "MESSAGE_SENT",
            Self::MessageReceived => "MESSAGE_RECEIVED",
            Self::MessageStatusUpdate => "MESSAGE_STATUS_UPDATE",
            Self::TypingStart => "TYPING_START",
            Self::TypingStop => "TYPING_STOP",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
        }
    }

    fn parse(raw: &str) -> Result<Self, ProtocolError> {
        match raw {
            "HEARTBEAT" => Ok(Self::Heartbeat),
            "MESSAGE_SENT" => Ok(Self::MessageSent),
            "MESSAGE_RECEIVED" => Ok(Self::MessageReceived),
            "MESSAGE_STATUS_UPDATE" => Ok(Self::MessageStatusUpdate),
            "TYPING_START" => Ok(Self::TypingStart),
            "TYPING_STOP" => Ok(Self::TypingStop),
            "PRESENCE_UPDATE" => Ok(Self::PresenceUpdate),
            other => Err(ProtocolError::UnknownType(other.to_owned())),
        }
    }
}

/// Delivery/read receipt for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub channel_id: String,
    pub message_id: String,
    pub status: MessageStatus,
    /// Reader for READ receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub channel_id: String,
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSignal {
    pub user_id: String,
    pub device_id: String,
    pub status: PresenceStatus,
    /// Sender clock, milliseconds since Unix epoch. Drives last-write-wins.
    pub timestamp: i64,
}

/// Typed payload, one variant per envelope type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Heartbeat,
    MessageSent(Message),
    MessageReceived(Message),
    MessageStatusUpdate(StatusUpdate),
    TypingStart(TypingSignal),
    TypingStop(TypingSignal),
    PresenceUpdate(PresenceSignal),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Heartbeat => EnvelopeKind::Heartbeat,
            Self::MessageSent(_) => EnvelopeKind::MessageSent,
            Self::MessageReceived(_) => EnvelopeKind::MessageReceived,
            Self::MessageStatusUpdate(_) => EnvelopeKind::MessageStatusUpdate,
            Self::TypingStart(_) => EnvelopeKind::TypingStart,
            Self::TypingStop(_) => EnvelopeKind::TypingStop,
            Self::PresenceUpdate(_) => EnvelopeKind::PresenceUpdate,
        }
    }

    fn to_value(&self) -> Value {
        let encoded = match self {
            Self::Heartbeat => return Value::Null,
            Self::MessageSent(m) | Self::MessageReceived(m) => serde_json::to_value(m),
            Self::MessageStatusUpdate(s) => serde_json::to_value(s),
            Self::TypingStart(t) | Self::TypingStop(t) => serde_json::to_value(t),
            Self::PresenceUpdate(p) => serde_json::to_value(p),
        };
        // Serializing plain derive structs into a Value cannot fail.
        encoded.unwrap_or(Value::Null)
    }

    fn from_value(kind: EnvelopeKind, value: Option<Value>) -> Result<Self, ProtocolError> {
        if kind == EnvelopeKind::Heartbeat {
            return Ok(Self::Heartbeat);
        }
        let value = value
            .filter(|v| !v.is_null())
            .ok_or(ProtocolError::MissingField("payload"))?;
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload { kind: kind.as_str(), message: e.to_string() };

        let payload = match kind {
            EnvelopeKind::Heartbeat => Self::Heartbeat,
            EnvelopeKind::MessageSent => Self::MessageSent(serde_json::from_value(value).map_err(invalid)?),
            EnvelopeKind::MessageReceived => Self::MessageReceived(serde_json::from_value(value).map_err(invalid)?),
            EnvelopeKind::MessageStatusUpdate => {
                Self::MessageStatusUpdate(serde_json::from_value(value).map_err(invalid)?)
            }
            EnvelopeKind::TypingStart => Self::TypingStart(serde_json::from_value(value).map_err(invalid)?),
            EnvelopeKind::TypingStop => Self::TypingStop(serde_json::from_value(value).map_err(invalid)?),
            EnvelopeKind::PresenceUpdate => Self::PresenceUpdate(serde_json::from_value(value).map_err(invalid)?),
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Reject payloads that parse but carry empty identifiers.
    fn validate(&self) -> Result<(), ProtocolError> {
        let required: Vec<(&'static str, &str)> = match self {
            Self::Heartbeat => Vec::new(),
            Self::MessageSent(m) | Self::MessageReceived(m) => {
                vec![("id", m.id.as_str()), ("channelId", m.channel_id.as_str()), ("senderId", m.sender_id.as_str())]
            }
            Self::MessageStatusUpdate(s) => vec![("channelId", s.channel_id.as_str()), ("messageId", s.message_id.as_str())],
            Self::TypingStart(t) | Self::TypingStop(t) => {
                vec![("channelId", t.channel_id.as_str()), ("userId", t.user_id.as_str())]
            }
            Self::PresenceUpdate(p) => vec![("userId", p.user_id.as_str()), ("deviceId", p.device_id.as_str())],
        };
        match required.iter().find(|(_, v)| v.is_empty()) {
            Some((field, _)) => Err(ProtocolError::MissingField(field)),
            None => Ok(()),
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Payload,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub timestamp: i64,
    pub message_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    timestamp: i64,
    message_id: String,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Envelope {
    /// Wrap a payload with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self { payload, timestamp: now_ms(), message_id: Uuid::new_v4().to_string() }
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(Payload::Heartbeat)
    }

    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    // =========================================================================
    // CODEC
    // =========================================================================

    /// Encode into a JSON text frame.
    #[must_use]
    pub fn encode(&self) -> String {
        let payload = match self.payload {
            Payload::Heartbeat => None,
            _ => Some(self.payload.to_value()),
        };
        let raw = RawEnvelope {
            kind: self.kind().as_str().to_owned(),
            payload,
            timestamp: self.timestamp,
            message_id: self.message_id.clone(),
        };
        serde_json::to_string(&raw).unwrap_or_default()
    }

    /// Decode and validate one JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for non-envelope JSON,
    /// [`ProtocolError::UnknownType`] for an unrecognized `type`, and
    /// [`ProtocolError::InvalidPayload`] / [`ProtocolError::MissingField`]
    /// when the payload does not match its type's schema.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if raw.message_id.is_empty() {
            return Err(ProtocolError::MissingField("messageId"));
        }
        let kind = EnvelopeKind::parse(&raw.kind)?;
        let payload = Payload::from_value(kind, raw.payload)?;
        Ok(Self { payload, timestamp: raw.timestamp, message_id: raw.message_id })
    }
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
