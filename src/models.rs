//! Domain types shared by the transport, coordination layers, and stores.
//!
//! Wire names are camelCase / SCREAMING_SNAKE_CASE so the same structs
//! serialize directly into envelope payloads.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTITY
// =============================================================================

/// The authenticated user a session acts on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
    pub role: String,
    pub device_id: String,
}

// =============================================================================
// MESSAGE
// =============================================================================

/// Delivery lifecycle of a message. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Sending | Self::Failed => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    ///
    /// FAILED is reachable only from SENDING and is terminal; everything
    /// else must strictly increase along SENDING < SENT < DELIVERED < READ.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Sending, Self::Failed) => true,
            (Self::Failed, _) | (_, Self::Failed) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    pub mime_type: String,
    pub size: u64,
}

/// A chat message. `id` is the client-generated id until the durable store
/// acknowledges it, then the server id; `client_id` keeps the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: String,
    pub channel_id: String,
    pub channel_type: ChannelType,
    /// Milliseconds since Unix epoch. Server-assigned once acknowledged.
    pub timestamp: i64,
    pub status: MessageStatus,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// SENT without a DELIVERED/READ within the ack timeout. Local only.
    #[serde(skip)]
    pub ack_overdue: bool,
}

impl Message {
    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            if matches!(next, MessageStatus::Delivered | MessageStatus::Read) {
                self.ack_overdue = false;
            }
            true
        } else {
            false
        }
    }

    /// Whether this entry is the same logical message as `other`, matching
    /// on server id or on the client id that produced it.
    #[must_use]
    pub fn same_message(&self, other: &Message) -> bool {
        if self.id == other.id {
            return true;
        }
        let ids = [Some(&self.id), self.client_id.as_ref()];
        let other_ids = [Some(&other.id), other.client_id.as_ref()];
        ids.iter()
            .flatten()
            .any(|id| other_ids.iter().flatten().any(|o| o == id))
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    ProjectGeneral,
    ProjectTeam,
    DirectMessage,
}

impl ChannelType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProjectGeneral => "PROJECT_GENERAL",
            Self::ProjectTeam => "PROJECT_TEAM",
            Self::DirectMessage => "DIRECT_MESSAGE",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PROJECT_GENERAL" => Some(Self::ProjectGeneral),
            "PROJECT_TEAM" => Some(Self::ProjectTeam),
            "DIRECT_MESSAGE" => Some(Self::DirectMessage),
            _ => None,
        }
    }
}

/// Summary of the newest message in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub id: String,
    pub content: String,
    pub sender_name: String,
    pub timestamp: i64,
}

impl From<&Message> for LastMessage {
    fn from(msg: &Message) -> Self {
        Self { id: msg.id.clone(), content: msg.content.clone(), sender_name: msg.sender_name.clone(), timestamp: msg.timestamp }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub participants: BTreeSet<String>,
    /// Unread counter per participant user id.
    #[serde(default)]
    pub unread: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
}

impl Channel {
    #[must_use]
    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }
}

/// Input to `create_channel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub name: String,
    pub channel_type: ChannelType,
    pub participant_ids: Vec<String>,
    pub project_id: Option<String>,
}

/// Input to the durable store's `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub channel_id: String,
    pub client_id: String,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: String,
    pub channel_type: ChannelType,
    pub attachments: Vec<Attachment>,
}

// =============================================================================
// PAGINATION
// =============================================================================

/// Cursor-based page request: newest `limit` messages strictly older than
/// `before` (or the newest overall when `before` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub before: Option<String>,
}

impl Pagination {
    #[must_use]
    pub fn latest(limit: usize) -> Self {
        Self { limit, before: None }
    }
}

/// One page of history, ascending by timestamp.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Pass as `before` to fetch the next older page. `None` at the start.
    pub next_cursor: Option<String>,
}

// =============================================================================
// TYPING
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub user_id: String,
    pub user_name: String,
    pub channel_id: String,
    pub timestamp: i64,
    pub is_typing: bool,
}

// =============================================================================
// PRESENCE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
    Busy,
}

impl PresenceStatus {
    /// Ordering for "most online across devices".
    #[must_use]
    pub fn availability(self) -> u8 {
        match self {
            Self::Online => 3,
            Self::Busy => 2,
            Self::Away => 1,
            Self::Offline => 0,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Away => "AWAY",
            Self::Offline => "OFFLINE",
            Self::Busy => "BUSY",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ONLINE" => Some(Self::Online),
            "AWAY" => Some(Self::Away),
            "OFFLINE" => Some(Self::Offline),
            "BUSY" => Some(Self::Busy),
            _ => None,
        }
    }
}

/// One device's presence. Keyed by `(user_id, device_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub device_id: String,
    pub status: PresenceStatus,
    pub last_seen: i64,
}

/// Per-user view derived at read time from the device entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePresence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: i64,
    pub device_count: usize,
}

#[cfg(test)]
#[path = "models_test.rs"]
mod tests;
