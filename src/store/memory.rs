//! In-process [`DurableStore`] used by tests and local demos.
//!
//! Feeds fan out synchronously to registered callbacks, outside the lock.
//! Two switches simulate a misbehaving backend: `set_unavailable` fails every
//! call with [`StoreError::Unavailable`], and `deny_channel` fails calls
//! touching one channel with [`StoreError::PermissionDenied`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use super::{
    DurableStore, FeedHandle, MessageAck, MessageCallback, TypingCallback, decode_cursor, encode_cursor,
};
use crate::envelope::now_ms;
use crate::error::StoreError;
use crate::models::{
    Channel, LastMessage, Message, MessagePage, MessageStatus, NewChannel, OutgoingMessage, Pagination,
    PresenceStatus, TypingIndicator, UserPresence,
};

#[derive(Default)]
struct MemoryState {
    channels: HashMap<String, Channel>,
    /// Per channel, ascending by `(timestamp, id)`.
    messages: HashMap<String, Vec<Message>>,
    typing: HashMap<String, BTreeMap<String, TypingIndicator>>,
    presence: HashMap<(String, String), UserPresence>,
    message_feeds: HashMap<String, Vec<(u64, MessageCallback)>>,
    typing_feeds: HashMap<String, Vec<(u64, TypingCallback)>>,
    next_feed_id: u64,
    last_timestamp: i64,
    unavailable: bool,
    feeds_paused: bool,
    denied: HashSet<String>,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn check_channel(&self, channel_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        if self.denied.contains(channel_id) {
            return Err(StoreError::PermissionDenied(format!("channel {channel_id}")));
        }
        if !self.channels.contains_key(channel_id) {
            return Err(StoreError::NotFound(format!("channel {channel_id}")));
        }
        Ok(())
    }

    /// Strictly increasing server clock.
    fn next_timestamp(&mut self) -> i64 {
        self.last_timestamp = now_ms().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn typing_list(&self, channel_id: &str) -> Vec<TypingIndicator> {
        self.typing
            .get(channel_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every call with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Persist writes but withhold live fan-out while set, as during an
    /// outage gap.
    pub fn set_feeds_paused(&self, paused: bool) {
        self.lock().feeds_paused = paused;
    }

    /// Fail calls touching `channel_id` with [`StoreError::PermissionDenied`].
    pub fn deny_channel(&self, channel_id: &str) {
        self.lock().denied.insert(channel_id.to_owned());
    }

    /// Number of live message feeds on `channel_id`.
    #[must_use]
    pub fn message_feed_count(&self, channel_id: &str) -> usize {
        self.lock().message_feeds.get(channel_id).map_or(0, Vec::len)
    }

    /// Number of live typing feeds on `channel_id`.
    #[must_use]
    pub fn typing_feed_count(&self, channel_id: &str) -> usize {
        self.lock().typing_feeds.get(channel_id).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn stored_messages(&self, channel_id: &str) -> Vec<Message> {
        self.lock().messages.get(channel_id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn presence(&self, user_id: &str, device_id: &str) -> Option<UserPresence> {
        self.lock()
            .presence
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .cloned()
    }

    fn publish_typing(&self, channel_id: &str) {
        let (feeds, list) = {
            let state = self.lock();
            if state.feeds_paused {
                return;
            }
            let feeds: Vec<TypingCallback> = state
                .typing_feeds
                .get(channel_id)
                .map(|fs| fs.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default();
            (feeds, state.typing_list(channel_id))
        };
        for feed in feeds {
            feed(list.clone());
        }
    }
}

#[async_trait::async_trait]
impl DurableStore for MemoryStore {
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        let created = Channel {
            id: Uuid::new_v4().to_string(),
            name: channel.name,
            channel_type: channel.channel_type,
            project_id: channel.project_id,
            participants: channel.participant_ids.into_iter().collect(),
            unread: BTreeMap::new(),
            last_message: None,
        };
        state.channels.insert(created.id.clone(), created.clone());
        state.messages.insert(created.id.clone(), Vec::new());
        Ok(created)
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, StoreError> {
        let state = self.lock();
        state.check_channel(channel_id)?;
        state
            .channels
            .get(channel_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))
    }

    async fn get_user_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let state = self.lock();
        state.check_available()?;
        let mut channels: Vec<Channel> = state
            .channels
            .values()
            .filter(|c| c.participants.contains(user_id) && !state.denied.contains(&c.id))
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(channels)
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<MessageAck, StoreError> {
        let (stored, feeds) = {
            let mut state = self.lock();
            state.check_channel(&message.channel_id)?;
            let is_member = state
                .channels
                .get(&message.channel_id)
                .is_some_and(|c| c.participants.contains(&message.sender_id));
            if !is_member {
                return Err(StoreError::PermissionDenied(format!(
                    "{} is not a member of {}",
                    message.sender_id, message.channel_id
                )));
            }

            let existing = state.messages.get(&message.channel_id).and_then(|log| {
                log.iter()
                    .find(|m| m.client_id.as_deref() == Some(message.client_id.as_str()))
                    .map(|m| MessageAck { id: m.id.clone(), timestamp: m.timestamp })
            });
            if let Some(ack) = existing {
                return Ok(ack);
            }

            let timestamp = state.next_timestamp();
            let stored = Message {
                id: Uuid::new_v4().to_string(),
                client_id: Some(message.client_id),
                content: message.content,
                sender_id: message.sender_id,
                sender_name: message.sender_name,
                sender_role: message.sender_role,
                channel_id: message.channel_id,
                channel_type: message.channel_type,
                timestamp,
                status: MessageStatus::Sent,
                read_by: std::collections::BTreeSet::new(),
                attachments: message.attachments,
                ack_overdue: false,
            };

            if let Some(channel) = state.channels.get_mut(&stored.channel_id) {
                for participant in &channel.participants {
                    if *participant != stored.sender_id {
                        *channel.unread.entry(participant.clone()).or_insert(0) += 1;
                    }
                }
                channel.last_message = Some(LastMessage::from(&stored));
            }
            state.messages.entry(stored.channel_id.clone()).or_default().push(stored.clone());

            let feeds: Vec<MessageCallback> = if state.feeds_paused {
                Vec::new()
            } else {
                state
                    .message_feeds
                    .get(&stored.channel_id)
                    .map(|fs| fs.iter().map(|(_, f)| Arc::clone(f)).collect())
                    .unwrap_or_default()
            };
            (stored, feeds)
        };

        for feed in feeds {
            feed(stored.clone());
        }
        Ok(MessageAck { id: stored.id, timestamp: stored.timestamp })
    }

    async fn load_messages(&self, channel_id: &str, pagination: &Pagination) -> Result<MessagePage, StoreError> {
        let state = self.lock();
        state.check_channel(channel_id)?;
        let log = state.messages.get(channel_id).map(Vec::as_slice).unwrap_or_default();

        let end = match &pagination.before {
            Some(cursor) => {
                let (ts, id) = decode_cursor(cursor)?;
                log.partition_point(|m| (m.timestamp, m.id.as_str()) < (ts, id.as_str()))
            }
            None => log.len(),
        };
        let start = end.saturating_sub(pagination.limit);
        let messages = log[start..end].to_vec();
        let next_cursor = (start > 0)
            .then(|| messages.first().map(|m| encode_cursor(m.timestamp, &m.id)))
            .flatten();
        Ok(MessagePage { messages, next_cursor })
    }

    async fn mark_message_as_read(&self, channel_id: &str, message_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        let message = state
            .messages
            .get_mut(channel_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        message.read_by.insert(user_id.to_owned());
        if user_id != message.sender_id {
            message.advance(MessageStatus::Read);
        }
        if let Some(channel) = state.channels.get_mut(channel_id) {
            channel.unread.insert(user_id.to_owned(), 0);
        }
        Ok(())
    }

    async fn subscribe_to_messages(&self, channel_id: &str, on_message: MessageCallback) -> Result<FeedHandle, StoreError> {
        let id = {
            let mut state = self.lock();
            state.check_channel(channel_id)?;
            state.next_feed_id += 1;
            let id = state.next_feed_id;
            state.message_feeds.entry(channel_id.to_owned()).or_default().push((id, on_message));
            id
        };
        let weak = Arc::downgrade(&self.state);
        let channel_id = channel_id.to_owned();
        Ok(FeedHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(feeds) = state.message_feeds.get_mut(&channel_id) {
                    feeds.retain(|(fid, _)| *fid != id);
                }
                debug!(%channel_id, feed = id, "memory store: feed closed");
            }
        }))
    }

    async fn subscribe_to_typing(&self, channel_id: &str, on_typing: TypingCallback) -> Result<FeedHandle, StoreError> {
        let id = {
            let mut state = self.lock();
            state.check_channel(channel_id)?;
            state.next_feed_id += 1;
            let id = state.next_feed_id;
            state.typing_feeds.entry(channel_id.to_owned()).or_default().push((id, on_typing));
            id
        };
        let weak = Arc::downgrade(&self.state);
        let channel_id = channel_id.to_owned();
        Ok(FeedHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(feeds) = state.typing_feeds.get_mut(&channel_id) {
                    feeds.retain(|(fid, _)| *fid != id);
                }
                debug!(%channel_id, feed = id, "memory store: feed closed");
            }
        }))
    }

    async fn set_typing_indicator(
        &self,
        channel_id: &str,
        user_id: &str,
        user_name: &str,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            state.check_channel(channel_id)?;
            let rows = state.typing.entry(channel_id.to_owned()).or_default();
            if is_typing {
                rows.insert(
                    user_id.to_owned(),
                    TypingIndicator {
                        user_id: user_id.to_owned(),
                        user_name: user_name.to_owned(),
                        channel_id: channel_id.to_owned(),
                        timestamp: now_ms(),
                        is_typing: true,
                    },
                );
            } else {
                rows.remove(user_id);
            }
        }
        self.publish_typing(channel_id);
        Ok(())
    }

    async fn update_presence(&self, user_id: &str, status: PresenceStatus, device_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_available()?;
        state.presence.insert(
            (user_id.to_owned(), device_id.to_owned()),
            UserPresence {
                user_id: user_id.to_owned(),
                device_id: device_id.to_owned(),
                status,
                last_seen: now_ms(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
