//! Chat session: one user's connection and coordination layers.
//!
//! DESIGN
//! ======
//! `ChatSession` owns exactly one `ConnectionManager` and the messaging,
//! typing, and presence components built on it. Nothing is global: two
//! sessions in one process share no state. `shutdown` tears everything
//! down in a fixed order so no timer or feed outlives the session.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Subscription};
use crate::error::ChatError;
use crate::messaging::{ChannelSubscription, DeliveryTicket, MessagingService};
use crate::models::{
    Attachment, Channel, ChannelType, EffectivePresence, Identity, Message, MessagePage, Pagination,
    PresenceStatus, TypingIndicator,
};
use crate::presence::PresenceTracker;
use crate::store::DurableStore;
use crate::transport::Connector;
use crate::typing::TypingIndicatorAggregator;

/// Read model handed to the UI for one open channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_status: ConnectionStatus,
    pub messages: Vec<Message>,
    pub channels: Vec<Channel>,
    pub typing_users: Vec<TypingIndicator>,
    pub user_presence: Vec<EffectivePresence>,
}

pub struct ChatSession {
    identity: Identity,
    connection: ConnectionManager,
    messaging: MessagingService,
    typing: TypingIndicatorAggregator,
    presence: PresenceTracker,
}

impl ChatSession {
    /// Wire a session together. Nothing touches the network until
    /// [`ChatSession::start`].
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidInput`] if the connection or typing
    /// config is invalid.
    pub fn new(
        identity: Identity,
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self, ChatError> {
        config.connection.validate()?;
        config.typing.validate()?;
        let connection = ConnectionManager::new(config.connection, connector);
        let messaging =
            MessagingService::new(identity.clone(), config.messaging, connection.clone(), Arc::clone(&store));
        let typing =
            TypingIndicatorAggregator::new(identity.clone(), config.typing, connection.clone(), Arc::clone(&store));
        let presence = PresenceTracker::new(identity.clone(), connection.clone(), store);

        let sink = typing.clone();
        messaging.set_typing_sink(Arc::new(move |channel_id: &str, rows: Vec<TypingIndicator>| {
            sink.apply_snapshot(channel_id, rows);
        }));

        Ok(Self { identity, connection, messaging, typing, presence })
    }

    /// Connect, load the channel list, and announce ONLINE.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be opened or the channel list cannot
    /// be loaded. A failed ONLINE announcement is only logged.
    pub async fn start(&self) -> Result<(), ChatError> {
        self.connection.connect().await?;
        self.messaging.load_channels().await?;
        if let Err(e) = self.presence.update_presence(PresenceStatus::Online).await {
            warn!(user_id = %self.identity.user_id, error = %e, "session: online announcement failed");
        }
        info!(user_id = %self.identity.user_id, device_id = %self.identity.device_id, "session: started");
        Ok(())
    }

    /// Announce OFFLINE (best-effort), release every feed and timer, and
    /// disconnect. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.connection.is_connected() {
            if let Err(e) = self.presence.update_presence(PresenceStatus::Offline).await {
                warn!(user_id = %self.identity.user_id, error = %e, "session: offline announcement failed");
            }
        }
        self.typing.shutdown();
        self.presence.shutdown();
        self.messaging.shutdown();
        self.connection.disconnect();
        info!(user_id = %self.identity.user_id, "session: shut down");
    }

    // =========================================================================
    // COMPONENTS
    // =========================================================================

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn messaging(&self) -> &MessagingService {
        &self.messaging
    }

    #[must_use]
    pub fn typing(&self) -> &TypingIndicatorAggregator {
        &self.typing
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChatError) + Send + Sync + 'static,
    {
        self.connection.on_error(listener)
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    /// # Errors
    ///
    /// See [`MessagingService::send_message`].
    pub fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<DeliveryTicket, ChatError> {
        self.messaging.send_message(channel_id, content, attachments)
    }

    /// # Errors
    ///
    /// See [`MessagingService::create_channel`].
    pub async fn create_channel(
        &self,
        name: &str,
        channel_type: ChannelType,
        participant_ids: &[String],
        project_id: Option<&str>,
    ) -> Result<String, ChatError> {
        self.messaging.create_channel(name, channel_type, participant_ids, project_id).await
    }

    /// # Errors
    ///
    /// See [`MessagingService::subscribe_to_channel`].
    pub async fn subscribe_to_channel(&self, channel_id: &str) -> Result<ChannelSubscription, ChatError> {
        self.messaging.subscribe_to_channel(channel_id).await
    }

    /// # Errors
    ///
    /// See [`MessagingService::load_message_history`].
    pub async fn load_message_history(&self, channel_id: &str, pagination: &Pagination) -> Result<MessagePage, ChatError> {
        self.messaging.load_message_history(channel_id, pagination).await
    }

    /// # Errors
    ///
    /// See [`TypingIndicatorAggregator::set_typing`].
    pub async fn set_typing(&self, channel_id: &str, is_typing: bool) -> Result<(), ChatError> {
        self.typing.set_typing(channel_id, is_typing).await
    }

    /// # Errors
    ///
    /// See [`PresenceTracker::update_presence`].
    pub async fn update_presence(&self, status: PresenceStatus) -> Result<(), ChatError> {
        self.presence.update_presence(status).await
    }

    /// # Errors
    ///
    /// See [`MessagingService::mark_message_as_read`].
    pub async fn mark_message_as_read(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.messaging.mark_message_as_read(channel_id, message_id).await
    }

    // =========================================================================
    // READ MODEL
    // =========================================================================

    #[must_use]
    pub fn snapshot(&self, channel_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            connection_status: self.connection.status(),
            messages: self.messaging.messages(channel_id),
            channels: self.messaging.channels(),
            typing_users: self.typing.typing_users(channel_id),
            user_presence: self.presence.get_all_presences(),
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
