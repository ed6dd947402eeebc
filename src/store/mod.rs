//! Durable store: persistence and live feeds behind the messaging layer.
//!
//! DESIGN
//! ======
//! The coordination layers never talk to a database directly. They go
//! through [`DurableStore`], which is implemented over Postgres for the
//! application and in memory for tests. Live feeds are callback based and
//! return a [`FeedHandle`] that tears the feed down when dropped.
//!
//! Pages are ordered by `(timestamp, id)`. A cursor is the
//! `"{timestamp}:{id}"` of the oldest message on the previous page.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use crate::error::StoreError;
use crate::models::{Channel, Message, MessagePage, NewChannel, OutgoingMessage, Pagination, PresenceStatus, TypingIndicator};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type TypingCallback = Arc<dyn Fn(Vec<TypingIndicator>) + Send + Sync>;

/// Durable acknowledgment of a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAck {
    pub id: String,
    /// Server-assigned timestamp, milliseconds since Unix epoch.
    pub timestamp: i64,
}

/// Live feed registration. The feed stops when this is dropped.
#[must_use = "dropping a FeedHandle ends the feed immediately"]
pub struct FeedHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl FeedHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Persistence collaborator. Authoritative for channels and history.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError>;

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, StoreError>;

    async fn get_user_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError>;

    /// Persist a message. Idempotent on `(channel_id, client_id)`: a repeat
    /// returns the original acknowledgment.
    async fn send_message(&self, message: OutgoingMessage) -> Result<MessageAck, StoreError>;

    async fn load_messages(&self, channel_id: &str, pagination: &Pagination) -> Result<MessagePage, StoreError>;

    async fn mark_message_as_read(&self, channel_id: &str, message_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn subscribe_to_messages(&self, channel_id: &str, on_message: MessageCallback) -> Result<FeedHandle, StoreError>;

    /// `on_typing` receives the full list of typing users on each change.
    async fn subscribe_to_typing(&self, channel_id: &str, on_typing: TypingCallback) -> Result<FeedHandle, StoreError>;

    async fn set_typing_indicator(
        &self,
        channel_id: &str,
        user_id: &str,
        user_name: &str,
        is_typing: bool,
    ) -> Result<(), StoreError>;

    async fn update_presence(&self, user_id: &str, status: PresenceStatus, device_id: &str) -> Result<(), StoreError>;
}

// =============================================================================
// CURSORS
// =============================================================================

#[must_use]
pub fn encode_cursor(timestamp: i64, id: &str) -> String {
    format!("{timestamp}:{id}")
}

/// Parse a cursor back into `(timestamp, id)`.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] for a cursor this module did not produce.
pub fn decode_cursor(cursor: &str) -> Result<(i64, String), StoreError> {
    let (ts, id) = cursor
        .split_once(':')
        .ok_or_else(|| StoreError::Backend(format!("bad cursor: {cursor}")))?;
    let ts = ts
        .parse::<i64>()
        .map_err(|_| StoreError::Backend(format!("bad cursor timestamp: {cursor}")))?;
    if id.is_empty() {
        return Err(StoreError::Backend(format!("bad cursor id: {cursor}")));
    }
    Ok((ts, id.to_owned()))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
