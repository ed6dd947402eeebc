//! Messaging service: channels, per-channel message logs, delivery.
//!
//! ARCHITECTURE
//! ============
//! The service sits between the UI commands and two collaborators: the
//! [`ConnectionManager`] for low-latency fan-out and the [`DurableStore`]
//! for persistence, history and live feeds. It owns a channel cache and one
//! ordered log per channel.
//!
//! DELIVERY
//! ========
//! `send_message` appends an optimistic SENDING entry keyed by a fresh
//! client id and returns at once. Persistence runs on its own task: the
//! store's acknowledgment rewrites the entry to the server id and server
//! timestamp and advances it to SENT; a store failure advances it to
//! FAILED. The entry keeps its client id so later copies (live feed,
//! relay, history) reconcile onto it instead of duplicating it.
//!
//! ORDERING
//! ========
//! Every inbound copy is merged by id or client id, then the log is
//! stable-sorted by timestamp. Local sends take `max(now, newest)` so they
//! append in call order until the server timestamp replaces it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MessagingConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Subscription};
use crate::envelope::{EnvelopeKind, Payload, StatusUpdate, now_ms};
use crate::error::{ChatError, StoreError};
use crate::models::{
    Attachment, Channel, ChannelType, Identity, LastMessage, Message, MessagePage, MessageStatus, NewChannel,
    OutgoingMessage, Pagination, TypingIndicator,
};
use crate::store::{DurableStore, FeedHandle, MessageAck};

const EVENT_CAPACITY: usize = 256;

/// Receives durable typing snapshots for subscribed channels.
pub type TypingSink = Arc<dyn Fn(&str, Vec<TypingIndicator>) + Send + Sync>;

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MessagingEvent {
    /// A message was added to, or changed in, a channel log.
    MessageUpserted { channel_id: String, message: Message },
    StatusChanged { channel_id: String, message_id: String, status: MessageStatus },
    DeliveryFailed { channel_id: String, client_id: String, error: ChatError },
    /// SENT with no DELIVERED/READ receipt within the ack timeout.
    AckOverdue { channel_id: String, message_id: String },
    ChannelsChanged,
}

// =============================================================================
// HANDLES
// =============================================================================

/// Returned by `send_message`. Resolves once the durable store answers.
pub struct DeliveryTicket {
    pub client_id: String,
    receipt: oneshot::Receiver<Result<String, ChatError>>,
}

impl DeliveryTicket {
    /// Wait for the durable acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Delivery`] or [`ChatError::Permission`] when
    /// persistence failed (the message is then FAILED), or
    /// [`ChatError::Delivery`] if the service shut down first.
    pub async fn acknowledged(self) -> Result<String, ChatError> {
        let Self { client_id, receipt } = self;
        receipt.await.unwrap_or_else(|_| {
            Err(ChatError::Delivery { message_id: client_id, reason: "delivery abandoned".into() })
        })
    }
}

/// One reference on a channel's live feed.
#[must_use = "keep the subscription and call unsubscribe() to release the feed"]
pub struct ChannelSubscription {
    channel_id: String,
    service: Weak<Inner>,
}

impl ChannelSubscription {
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.service.upgrade() {
            inner.release_feed(&self.channel_id);
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

enum Merge {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Default)]
struct ChannelLog {
    /// Stable-sorted by timestamp.
    messages: Vec<Message>,
}

impl ChannelLog {
    fn position(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.id == id || m.client_id.as_deref() == Some(id))
    }

    fn newest_timestamp(&self) -> i64 {
        self.messages.last().map_or(0, |m| m.timestamp)
    }

    fn sort(&mut self) {
        self.messages.sort_by_key(|m| m.timestamp);
    }

    /// Insert `incoming` or fold it into the entry for the same message.
    /// A copy whose id differs from its client id is durable and carries the
    /// authoritative id and timestamp. Status only moves forward.
    fn merge(&mut self, incoming: Message) -> (Merge, Message) {
        let Some(pos) = self.messages.iter().position(|m| m.same_message(&incoming)) else {
            self.messages.push(incoming.clone());
            self.sort();
            return (Merge::Inserted, incoming);
        };

        let entry = &mut self.messages[pos];
        let before = entry.clone();
        let durable = incoming.client_id.as_deref() != Some(incoming.id.as_str());
        if durable {
            entry.id.clone_from(&incoming.id);
            entry.timestamp = incoming.timestamp;
        }
        if entry.client_id.is_none() {
            entry.client_id.clone_from(&incoming.client_id);
        }
        entry.advance(incoming.status);
        entry.read_by.extend(incoming.read_by.iter().cloned());
        if entry.attachments.is_empty() && !incoming.attachments.is_empty() {
            entry.attachments.clone_from(&incoming.attachments);
        }

        let merged = entry.clone();
        if merged == before {
            return (Merge::Unchanged, merged);
        }
        self.sort();
        (Merge::Updated, merged)
    }
}

#[derive(Default)]
struct ChannelFeed {
    refs: usize,
    messages: Option<FeedHandle>,
    typing: Option<FeedHandle>,
}

impl ChannelFeed {
    fn close(self) {
        for handle in [self.messages, self.typing].into_iter().flatten() {
            handle.unsubscribe();
        }
    }
}

#[derive(Default)]
struct MessagingState {
    channels: BTreeMap<String, Channel>,
    logs: HashMap<String, ChannelLog>,
    feeds: HashMap<String, ChannelFeed>,
    /// In-flight persistence, by client id.
    inflight: HashMap<String, JoinHandle<()>>,
    /// Ack timers, by client id.
    ack_timers: HashMap<String, JoinHandle<()>>,
    was_connected: bool,
    ever_connected: bool,
}

struct Inner {
    identity: Identity,
    config: MessagingConfig,
    connection: ConnectionManager,
    store: Arc<dyn DurableStore>,
    state: Mutex<MessagingState>,
    events: broadcast::Sender<MessagingEvent>,
    typing_sink: Mutex<Option<TypingSink>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn delivery_error(client_id: &str, err: StoreError) -> ChatError {
    match err {
        StoreError::PermissionDenied(msg) => ChatError::Permission(msg),
        other => ChatError::Delivery { message_id: client_id.to_owned(), reason: other.to_string() },
    }
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

impl MessagingService {
    /// Build the service and register its transport handlers.
    #[must_use]
    pub fn new(
        identity: Identity,
        config: MessagingConfig,
        connection: ConnectionManager,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            identity,
            config,
            connection,
            store,
            state: Mutex::new(MessagingState::default()),
            events,
            typing_sink: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        });
        Inner::attach(&inner);
        Self { inner }
    }

    pub fn events(&self) -> broadcast::Receiver<MessagingEvent> {
        self.inner.events.subscribe()
    }

    /// Route durable typing snapshots of subscribed channels to `sink`.
    pub fn set_typing_sink(&self, sink: TypingSink) {
        *lock(&self.inner.typing_sink) = Some(sink);
    }

    // =========================================================================
    // READ MODELS
    // =========================================================================

    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.inner.state).channels.values().cloned().collect()
    }

    #[must_use]
    pub fn channel(&self, channel_id: &str) -> Option<Channel> {
        lock(&self.inner.state).channels.get(channel_id).cloned()
    }

    /// Snapshot of a channel's log, ascending by timestamp.
    #[must_use]
    pub fn messages(&self, channel_id: &str) -> Vec<Message> {
        lock(&self.inner.state)
            .logs
            .get(channel_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subscriber_count(&self, channel_id: &str) -> usize {
        lock(&self.inner.state).feeds.get(channel_id).map_or(0, |f| f.refs)
    }

    // =========================================================================
    // CHANNELS
    // =========================================================================

    /// Replace the channel cache with the user's channels from the store.
    ///
    /// # Errors
    ///
    /// Propagates store failures as [`ChatError`].
    pub async fn load_channels(&self) -> Result<Vec<Channel>, ChatError> {
        self.inner.refresh_channels().await
    }

    /// Persist a new channel and refresh the cache. The current user is
    /// always a participant. Returns the channel id.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidInput`] for a blank name, otherwise
    /// propagates store failures.
    pub async fn create_channel(
        &self,
        name: &str,
        channel_type: ChannelType,
        participant_ids: &[String],
        project_id: Option<&str>,
    ) -> Result<String, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidInput("channel name is empty".into()));
        }
        let mut participants: Vec<String> = participant_ids.to_vec();
        if !participants.contains(&self.inner.identity.user_id) {
            participants.push(self.inner.identity.user_id.clone());
        }

        let created = self
            .inner
            .store
            .create_channel(NewChannel {
                name: name.to_owned(),
                channel_type,
                participant_ids: participants,
                project_id: project_id.map(str::to_owned),
            })
            .await?;
        info!(channel_id = %created.id, kind = channel_type.as_str(), "messaging: channel created");
        self.inner.refresh_channels().await?;
        Ok(created.id)
    }

    // =========================================================================
    // SEND
    // =========================================================================

    /// Append an optimistic message and persist it in the background.
    ///
    /// Never waits on the network. If connected, the message is also pushed
    /// over the transport. The returned ticket resolves when the store
    /// acknowledges or rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidInput`] when both content and attachments
    /// are empty. Delivery failures are reported through the ticket and
    /// [`MessagingEvent::DeliveryFailed`], never here.
    pub fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<DeliveryTicket, ChatError> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::InvalidInput("message is empty".into()));
        }
        Ok(self.inner.send(channel_id, content.to_owned(), attachments))
    }

    /// Re-send a FAILED message under a new client id, replacing the failed
    /// entry.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotFound`] for an unknown message and
    /// [`ChatError::InvalidInput`] if it has not failed.
    pub fn retry_message(&self, channel_id: &str, message_id: &str) -> Result<DeliveryTicket, ChatError> {
        let failed = {
            let mut state = lock(&self.inner.state);
            let log = state
                .logs
                .get_mut(channel_id)
                .ok_or_else(|| ChatError::NotFound(format!("channel {channel_id}")))?;
            let pos = log
                .position(message_id)
                .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
            if log.messages[pos].status != MessageStatus::Failed {
                return Err(ChatError::InvalidInput(format!("message {message_id} has not failed")));
            }
            log.messages.remove(pos)
        };
        info!(%channel_id, %message_id, "messaging: retrying failed message");
        Ok(self.inner.send(channel_id, failed.content, failed.attachments))
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Fetch one page from the store and merge it into the local log.
    /// Safe to repeat: already-present messages are reconciled, not
    /// duplicated.
    ///
    /// # Errors
    ///
    /// Propagates store failures; access denial is [`ChatError::Permission`].
    pub async fn load_message_history(&self, channel_id: &str, pagination: &Pagination) -> Result<MessagePage, ChatError> {
        let page = self.inner.store.load_messages(channel_id, pagination).await?;
        for message in &page.messages {
            self.inner.merge_incoming(message.clone());
        }
        debug!(%channel_id, count = page.messages.len(), more = page.next_cursor.is_some(), "messaging: history page merged");
        Ok(page)
    }

    // =========================================================================
    // RECEIPTS
    // =========================================================================

    /// Record that the current user read `message_id`. Idempotent: a repeat
    /// call changes nothing and sends nothing.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn mark_message_as_read(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError> {
        let me = self.inner.identity.user_id.clone();
        let durable_id = {
            let state = lock(&self.inner.state);
            match state.logs.get(channel_id).and_then(|log| log.position(message_id).map(|p| &log.messages[p])) {
                Some(m) if m.read_by.contains(&me) => return Ok(()),
                Some(m) => m.id.clone(),
                None => message_id.to_owned(),
            }
        };

        self.inner.store.mark_message_as_read(channel_id, &durable_id, &me).await?;

        let changed = {
            let mut state = lock(&self.inner.state);
            if let Some(channel) = state.channels.get_mut(channel_id) {
                channel.unread.insert(me.clone(), 0);
            }
            state.logs.get_mut(channel_id).and_then(|log| {
                let pos = log.position(&durable_id)?;
                let entry = &mut log.messages[pos];
                let inserted = entry.read_by.insert(me.clone());
                if entry.sender_id != me {
                    entry.advance(MessageStatus::Read);
                }
                inserted.then(|| entry.clone())
            })
        };
        if let Some(message) = changed {
            self.inner.emit(MessagingEvent::MessageUpserted { channel_id: channel_id.to_owned(), message });
        }

        if self.inner.connection.is_connected() {
            let update = StatusUpdate {
                channel_id: channel_id.to_owned(),
                message_id: durable_id,
                status: MessageStatus::Read,
                user_id: Some(me),
            };
            if let Err(e) = self.inner.connection.send(Payload::MessageStatusUpdate(update)) {
                debug!(error = %e, "messaging: read receipt not pushed");
            }
        }
        Ok(())
    }

    // =========================================================================
    // LIVE FEEDS
    // =========================================================================

    /// Take a reference on the channel's live feed (messages and typing).
    /// The store feeds open on the first reference.
    ///
    /// # Errors
    ///
    /// Propagates store failures from opening the feeds; the reference is
    /// not taken in that case.
    pub async fn subscribe_to_channel(&self, channel_id: &str) -> Result<ChannelSubscription, ChatError> {
        let first = {
            let mut state = lock(&self.inner.state);
            let feed = state.feeds.entry(channel_id.to_owned()).or_default();
            feed.refs += 1;
            feed.refs == 1
        };

        if first {
            if let Err(e) = Inner::open_feeds(&self.inner, channel_id).await {
                self.inner.release_feed(channel_id);
                return Err(e);
            }
        }
        Ok(ChannelSubscription { channel_id: channel_id.to_owned(), service: Arc::downgrade(&self.inner) })
    }

    /// Drop one reference on the channel's live feed.
    pub fn unsubscribe_from_channel(&self, channel_id: &str) {
        self.inner.release_feed(channel_id);
    }

    /// Cancel timers, pending persistence and feeds; detach from the
    /// transport.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

// =============================================================================
// INTERNALS
// =============================================================================

impl Inner {
    fn attach(this: &Arc<Self>) {
        let mut subs = Vec::new();
        for kind in [EnvelopeKind::MessageReceived, EnvelopeKind::MessageSent] {
            let weak = Arc::downgrade(this);
            subs.push(this.connection.on_message(kind, move |env| {
                let (Payload::MessageReceived(message) | Payload::MessageSent(message)) = &env.payload else {
                    return Ok(());
                };
                if let Some(inner) = weak.upgrade() {
                    if !inner.follows(&message.channel_id) {
                        debug!(channel_id = %message.channel_id, "messaging: live frame for unfollowed channel dropped");
                        return Ok(());
                    }
                    let mut message = message.clone();
                    message.advance(MessageStatus::Sent);
                    inner.merge_incoming(message);
                }
                Ok(())
            }));
        }

        let weak = Arc::downgrade(this);
        subs.push(this.connection.on_message(EnvelopeKind::MessageStatusUpdate, move |env| {
            if let (Payload::MessageStatusUpdate(update), Some(inner)) = (&env.payload, weak.upgrade()) {
                inner.apply_status_update(update);
            }
            Ok(())
        }));

        let weak = Arc::downgrade(this);
        subs.push(this.connection.on_connection_change(move |status| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_connection_change(&inner, status);
            }
        }));

        *lock(&this.subscriptions) = subs;
    }

    fn emit(&self, event: MessagingEvent) {
        let _ = self.events.send(event);
    }

    /// Live transport frames are accepted only for channels in our cache or
    /// with an open feed.
    fn follows(&self, channel_id: &str) -> bool {
        let state = lock(&self.state);
        state.channels.contains_key(channel_id) || state.feeds.contains_key(channel_id)
    }

    async fn refresh_channels(&self) -> Result<Vec<Channel>, ChatError> {
        let channels = self.store.get_user_channels(&self.identity.user_id).await?;
        {
            let mut state = lock(&self.state);
            state.channels = channels.iter().map(|c| (c.id.clone(), c.clone())).collect();
            for channel in &channels {
                state.logs.entry(channel.id.clone()).or_default();
            }
        }
        debug!(count = channels.len(), "messaging: channel cache refreshed");
        self.emit(MessagingEvent::ChannelsChanged);
        Ok(channels)
    }

    fn send(self: &Arc<Self>, channel_id: &str, content: String, attachments: Vec<Attachment>) -> DeliveryTicket {
        let client_id = Uuid::new_v4().to_string();
        let (tx, receipt) = oneshot::channel();

        let message = {
            let mut state = lock(&self.state);
            let channel_type = state
                .channels
                .get(channel_id)
                .map_or(ChannelType::ProjectGeneral, |c| c.channel_type);
            let log = state.logs.entry(channel_id.to_owned()).or_default();
            let message = Message {
                id: client_id.clone(),
                client_id: Some(client_id.clone()),
                content,
                sender_id: self.identity.user_id.clone(),
                sender_name: self.identity.user_name.clone(),
                sender_role: self.identity.role.clone(),
                channel_id: channel_id.to_owned(),
                channel_type,
                timestamp: now_ms().max(log.newest_timestamp()),
                status: MessageStatus::Sending,
                read_by: std::collections::BTreeSet::new(),
                attachments,
                ack_overdue: false,
            };
            log.messages.push(message.clone());
            update_summary(&mut state, channel_id);

            let outgoing = OutgoingMessage {
                channel_id: channel_id.to_owned(),
                client_id: client_id.clone(),
                content: message.content.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: message.sender_name.clone(),
                sender_role: message.sender_role.clone(),
                channel_type,
                attachments: message.attachments.clone(),
            };
            let inner = Arc::clone(self);
            let (task_channel, task_client) = (channel_id.to_owned(), client_id.clone());
            let handle = tokio::spawn(async move {
                let result = inner.store.send_message(outgoing).await;
                inner.complete_send(&task_channel, &task_client, result, tx);
            });
            state.inflight.insert(client_id.clone(), handle);
            message
        };

        debug!(%channel_id, %client_id, "messaging: message queued");
        self.emit(MessagingEvent::MessageUpserted { channel_id: channel_id.to_owned(), message: message.clone() });

        if self.connection.is_connected() {
            if let Err(e) = self.connection.send(Payload::MessageSent(message)) {
                debug!(error = %e, %client_id, "messaging: live push skipped");
            }
        }

        DeliveryTicket { client_id, receipt }
    }

    /// Second phase of a send: reconcile the optimistic entry with the
    /// store's answer.
    fn complete_send(
        self: &Arc<Self>,
        channel_id: &str,
        client_id: &str,
        result: Result<MessageAck, StoreError>,
        tx: oneshot::Sender<Result<String, ChatError>>,
    ) {
        match result {
            Ok(ack) => {
                let reconciled = {
                    let mut state = lock(&self.state);
                    state.inflight.remove(client_id);
                    let reconciled = state.logs.get_mut(channel_id).and_then(|log| {
                        let pos = log.position(client_id)?;
                        let mut durable = log.messages[pos].clone();
                        durable.id.clone_from(&ack.id);
                        durable.timestamp = ack.timestamp;
                        durable.status = MessageStatus::Sent;
                        let (outcome, merged) = log.merge(durable);
                        Some((!matches!(outcome, Merge::Unchanged), merged))
                    });
                    if let Some((_, merged)) = &reconciled {
                        update_summary(&mut state, channel_id);
                        if merged.status == MessageStatus::Sent {
                            let timer = self.spawn_ack_timer(channel_id, client_id);
                            if let Some(previous) = state.ack_timers.insert(client_id.to_owned(), timer) {
                                previous.abort();
                            }
                        }
                    }
                    reconciled
                };

                info!(%channel_id, %client_id, message_id = %ack.id, "messaging: message acknowledged");
                if let Some((changed, message)) = reconciled {
                    self.emit(MessagingEvent::StatusChanged {
                        channel_id: channel_id.to_owned(),
                        message_id: message.id.clone(),
                        status: message.status,
                    });
                    if changed {
                        self.emit(MessagingEvent::MessageUpserted { channel_id: channel_id.to_owned(), message });
                    }
                }
                let _ = tx.send(Ok(ack.id));
            }
            Err(err) => {
                let error = delivery_error(client_id, err);
                let failed = {
                    let mut state = lock(&self.state);
                    state.inflight.remove(client_id);
                    state.logs.get_mut(channel_id).and_then(|log| {
                        let pos = log.position(client_id)?;
                        let entry = &mut log.messages[pos];
                        entry.advance(MessageStatus::Failed).then(|| entry.clone())
                    })
                };

                warn!(%channel_id, %client_id, error = %error, "messaging: delivery failed");
                if let Some(message) = failed {
                    self.emit(MessagingEvent::StatusChanged {
                        channel_id: channel_id.to_owned(),
                        message_id: message.id.clone(),
                        status: MessageStatus::Failed,
                    });
                    self.emit(MessagingEvent::MessageUpserted { channel_id: channel_id.to_owned(), message });
                }
                self.emit(MessagingEvent::DeliveryFailed {
                    channel_id: channel_id.to_owned(),
                    client_id: client_id.to_owned(),
                    error: error.clone(),
                });
                let _ = tx.send(Err(error));
            }
        }
    }

    fn spawn_ack_timer(self: &Arc<Self>, channel_id: &str, client_id: &str) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.ack_timeout;
        let (channel_id, client_id) = (channel_id.to_owned(), client_id.to_owned());
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.flag_overdue(&channel_id, &client_id);
            }
        })
    }

    /// Flag a still-SENT message. Status is left alone.
    fn flag_overdue(&self, channel_id: &str, client_id: &str) {
        let flagged = {
            let mut state = lock(&self.state);
            state.ack_timers.remove(client_id);
            state.logs.get_mut(channel_id).and_then(|log| {
                let pos = log.position(client_id)?;
                let entry = &mut log.messages[pos];
                (entry.status == MessageStatus::Sent && !entry.ack_overdue).then(|| {
                    entry.ack_overdue = true;
                    entry.clone()
                })
            })
        };
        if let Some(message) = flagged {
            warn!(%channel_id, message_id = %message.id, "messaging: no delivery receipt within ack timeout");
            self.emit(MessagingEvent::AckOverdue { channel_id: channel_id.to_owned(), message_id: message.id.clone() });
            self.emit(MessagingEvent::MessageUpserted { channel_id: channel_id.to_owned(), message });
        }
    }

    fn merge_incoming(&self, message: Message) {
        let me = &self.identity.user_id;
        let channel_id = message.channel_id.clone();
        let outcome = {
            let mut state = lock(&self.state);
            let (outcome, merged) = state.logs.entry(channel_id.clone()).or_default().merge(message);
            if matches!(outcome, Merge::Inserted) && merged.sender_id != *me && !merged.read_by.contains(me) {
                if let Some(channel) = state.channels.get_mut(&channel_id) {
                    *channel.unread.entry(me.clone()).or_insert(0) += 1;
                }
            }
            if !matches!(outcome, Merge::Unchanged) {
                update_summary(&mut state, &channel_id);
                if matches!(merged.status, MessageStatus::Delivered | MessageStatus::Read) {
                    let key = merged.client_id.clone().unwrap_or_else(|| merged.id.clone());
                    if let Some(timer) = state.ack_timers.remove(&key) {
                        timer.abort();
                    }
                }
            }
            (outcome, merged)
        };

        match outcome {
            (Merge::Unchanged, _) => {}
            (_, message) => self.emit(MessagingEvent::MessageUpserted { channel_id, message }),
        }
    }

    fn apply_status_update(&self, update: &StatusUpdate) {
        let changed = {
            let mut state = lock(&self.state);
            let Some(log) = state.logs.get_mut(&update.channel_id) else {
                debug!(channel_id = %update.channel_id, "messaging: status update for unknown channel");
                return;
            };
            let Some(pos) = log.position(&update.message_id) else {
                debug!(message_id = %update.message_id, "messaging: status update for unknown message");
                return;
            };
            let entry = &mut log.messages[pos];
            let moved = entry.advance(update.status);
            let reader_added = match (&update.user_id, update.status) {
                (Some(user), MessageStatus::Read) => entry.read_by.insert(user.clone()),
                _ => false,
            };
            let snapshot = entry.clone();
            if moved && matches!(update.status, MessageStatus::Delivered | MessageStatus::Read) {
                let key = snapshot.client_id.clone().unwrap_or_else(|| snapshot.id.clone());
                if let Some(timer) = state.ack_timers.remove(&key) {
                    timer.abort();
                }
            }
            (moved || reader_added).then_some((moved, snapshot))
        };

        if let Some((moved, message)) = changed {
            let channel_id = update.channel_id.clone();
            if moved {
                self.emit(MessagingEvent::StatusChanged {
                    channel_id: channel_id.clone(),
                    message_id: message.id.clone(),
                    status: message.status,
                });
            }
            self.emit(MessagingEvent::MessageUpserted { channel_id, message });
        }
    }

    fn on_connection_change(this: &Arc<Self>, status: &ConnectionStatus) {
        let catch_up = {
            let mut state = lock(&this.state);
            let reconnected = status.connected && !state.was_connected && state.ever_connected;
            state.ever_connected |= status.connected;
            state.was_connected = status.connected;
            reconnected.then(|| state.feeds.keys().cloned().collect::<Vec<_>>())
        };
        let Some(channels) = catch_up else {
            return;
        };

        info!(channels = channels.len(), "messaging: reconnected, catching up");
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let page = Pagination::latest(inner.config.history_page_size);
            for channel_id in channels {
                match inner.store.load_messages(&channel_id, &page).await {
                    Ok(page) => {
                        for message in page.messages {
                            inner.merge_incoming(message);
                        }
                    }
                    Err(e) => warn!(%channel_id, error = %e, "messaging: catch-up fetch failed"),
                }
            }
            if let Err(e) = inner.refresh_channels().await {
                warn!(error = %e, "messaging: channel refresh after reconnect failed");
            }
        });
    }

    async fn open_feeds(this: &Arc<Self>, channel_id: &str) -> Result<(), ChatError> {
        let weak = Arc::downgrade(this);
        let messages = this
            .store
            .subscribe_to_messages(
                channel_id,
                Arc::new(move |message: Message| {
                    if let Some(inner) = weak.upgrade() {
                        inner.merge_incoming(message);
                    }
                }),
            )
            .await?;

        let weak = Arc::downgrade(this);
        let typing_channel = channel_id.to_owned();
        let typing = this
            .store
            .subscribe_to_typing(
                channel_id,
                Arc::new(move |rows: Vec<TypingIndicator>| {
                    let sink = weak.upgrade().and_then(|inner| lock(&inner.typing_sink).clone());
                    if let Some(sink) = sink {
                        sink(&typing_channel, rows);
                    }
                }),
            )
            .await?;

        let mut state = lock(&this.state);
        match state.feeds.get_mut(channel_id) {
            Some(feed) if feed.refs > 0 => {
                feed.messages = Some(messages);
                feed.typing = Some(typing);
                info!(%channel_id, "messaging: channel feed opened");
            }
            // Released while opening; dropping the handles closes the feeds.
            _ => debug!(%channel_id, "messaging: feed released before open completed"),
        }
        Ok(())
    }

    fn release_feed(&self, channel_id: &str) {
        let closed = {
            let mut state = lock(&self.state);
            let Some(feed) = state.feeds.get_mut(channel_id) else {
                return;
            };
            feed.refs = feed.refs.saturating_sub(1);
            if feed.refs > 0 {
                return;
            }
            state.feeds.remove(channel_id)
        };
        if let Some(feed) = closed {
            feed.close();
            info!(%channel_id, "messaging: channel feed closed");
        }
    }

    fn shutdown(&self) {
        let (feeds, tasks) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let feeds: Vec<ChannelFeed> = state.feeds.drain().map(|(_, f)| f).collect();
            let tasks: Vec<JoinHandle<()>> = state
                .inflight
                .drain()
                .chain(state.ack_timers.drain())
                .map(|(_, h)| h)
                .collect();
            (feeds, tasks)
        };
        for task in tasks {
            task.abort();
        }
        for feed in feeds {
            feed.close();
        }
        for sub in lock(&self.subscriptions).drain(..) {
            sub.unsubscribe();
        }
        info!(user_id = %self.identity.user_id, "messaging: shut down");
    }
}

/// Point the cached channel's `last_message` at the newest log entry.
fn update_summary(state: &mut MessagingState, channel_id: &str) {
    let newest = state
        .logs
        .get(channel_id)
        .and_then(|log| log.messages.last())
        .map(LastMessage::from);
    if let (Some(channel), Some(newest)) = (state.channels.get_mut(channel_id), newest) {
        channel.last_message = Some(newest);
    }
}

#[cfg(test)]
#[path = "messaging_test.rs"]
mod tests;
