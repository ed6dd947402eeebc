//! Postgres [`DurableStore`] over `sqlx`.
//!
//! DESIGN
//! ======
//! Channels, memberships (with per-user unread counters), messages, read
//! receipts, typing rows and per-device presence each have a table; see
//! `src/db/migrations`. Message timestamps are assigned by the database
//! clock on insert.
//!
//! Live feeds use `LISTEN/NOTIFY`. Writers `pg_notify` a small key
//! (`"{channel_id}:{message_id}"` or `"{channel_id}"`) inside the write
//! transaction, and each feed runs a `PgListener` task that filters on its
//! channel and re-reads the rows. Payloads stay far below the NOTIFY size
//! limit regardless of message size.

use std::collections::HashMap;

use sqlx::postgres::{PgListener, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DurableStore, FeedHandle, MessageAck, MessageCallback, TypingCallback, decode_cursor, encode_cursor};
use crate::envelope::now_ms;
use crate::error::StoreError;
use crate::models::{
    Attachment, Channel, ChannelType, LastMessage, Message, MessagePage, MessageStatus, NewChannel,
    OutgoingMessage, Pagination, PresenceStatus, TypingIndicator,
};

const MESSAGE_NOTIFY: &str = "chat_messages";
const TYPING_NOTIFY: &str = "chat_typing";

const MESSAGE_SELECT: &str = "SELECT m.id, m.client_id, m.content, m.sender_id, m.sender_name, m.sender_role,
        m.channel_id, m.channel_type, m.ts, m.attachments,
        COALESCE(array_agg(r.user_id) FILTER (WHERE r.user_id IS NOT NULL), ARRAY[]::text[]) AS read_by
 FROM chat_messages m
 LEFT JOIN chat_message_reads r ON r.message_id = m.id";

type ChannelRow = (Uuid, String, String, Option<String>);

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url` and run the chat migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached
    /// or migrated.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = crate::db::init_pool(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }
}

/// Ids are UUIDs in storage; anything else cannot exist.
fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|_| StoreError::NotFound(raw.to_owned()))
}

fn parse_channel_type(raw: &str) -> Result<ChannelType, StoreError> {
    ChannelType::parse(raw).ok_or_else(|| StoreError::Backend(format!("unknown channel type {raw}")))
}

fn row_to_message(row: &PgRow) -> Result<Message, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let channel_id: Uuid = row.try_get("channel_id")?;
    let channel_type: String = row.try_get("channel_type")?;
    let sender_id: String = row.try_get("sender_id")?;
    let read_by: Vec<String> = row.try_get("read_by")?;
    let Json(attachments): Json<Vec<Attachment>> = row.try_get("attachments")?;

    let status = if read_by.iter().any(|u| *u != sender_id) { MessageStatus::Read } else { MessageStatus::Sent };
    Ok(Message {
        id: id.to_string(),
        client_id: row.try_get("client_id")?,
        content: row.try_get("content")?,
        sender_id,
        sender_name: row.try_get("sender_name")?,
        sender_role: row.try_get("sender_role")?,
        channel_id: channel_id.to_string(),
        channel_type: parse_channel_type(&channel_type)?,
        timestamp: row.try_get("ts")?,
        status,
        read_by: read_by.into_iter().collect(),
        attachments,
        ack_overdue: false,
    })
}

async fn fetch_message(pool: &PgPool, message_id: Uuid) -> Result<Option<Message>, StoreError> {
    let sql = format!("{MESSAGE_SELECT} WHERE m.id = $1 GROUP BY m.id");
    let row = sqlx::query(&sql).bind(message_id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_message).transpose()
}

async fn fetch_typing(pool: &PgPool, channel_id: Uuid) -> Result<Vec<TypingIndicator>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT user_id, user_name, ts FROM chat_typing WHERE channel_id = $1 ORDER BY user_id",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;

    let channel = channel_id.to_string();
    Ok(rows
        .into_iter()
        .map(|(user_id, user_name, timestamp)| TypingIndicator {
            user_id,
            user_name,
            channel_id: channel.clone(),
            timestamp,
            is_typing: true,
        })
        .collect())
}

/// Attach participants, unread counters and the newest message to channel rows.
async fn hydrate_channels(pool: &PgPool, rows: Vec<ChannelRow>) -> Result<Vec<Channel>, StoreError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut members = QueryBuilder::new("SELECT channel_id, user_id, unread FROM chat_channel_members WHERE channel_id IN (");
    {
        let mut separated = members.separated(", ");
        for (id, ..) in &rows {
            separated.push_bind(*id);
        }
    }
    members.push(")");
    let member_rows = members
        .build_query_as::<(Uuid, String, i32)>()
        .fetch_all(pool)
        .await?;

    let mut latest = QueryBuilder::new(
        "SELECT DISTINCT ON (channel_id) channel_id, id, content, sender_name, ts
         FROM chat_messages
         WHERE channel_id IN (",
    );
    {
        let mut separated = latest.separated(", ");
        for (id, ..) in &rows {
            separated.push_bind(*id);
        }
    }
    latest.push(") ORDER BY channel_id, ts DESC, id DESC");
    let latest_rows = latest
        .build_query_as::<(Uuid, Uuid, String, String, i64)>()
        .fetch_all(pool)
        .await?;

    let mut last_by_channel: HashMap<Uuid, LastMessage> = latest_rows
        .into_iter()
        .map(|(channel_id, id, content, sender_name, timestamp)| {
            (channel_id, LastMessage { id: id.to_string(), content, sender_name, timestamp })
        })
        .collect();

    let mut channels = Vec::with_capacity(rows.len());
    for (id, name, channel_type, project_id) in rows {
        let mut channel = Channel {
            id: id.to_string(),
            name,
            channel_type: parse_channel_type(&channel_type)?,
            project_id,
            participants: std::collections::BTreeSet::new(),
            unread: std::collections::BTreeMap::new(),
            last_message: last_by_channel.remove(&id),
        };
        for (_, user_id, unread) in member_rows.iter().filter(|(cid, ..)| *cid == id) {
            channel.participants.insert(user_id.clone());
            if *unread > 0 {
                channel.unread.insert(user_id.clone(), u32::try_from(*unread).unwrap_or(0));
            }
        }
        channels.push(channel);
    }
    Ok(channels)
}

/// Spawn a `LISTEN` loop that forwards notifications for one channel.
async fn spawn_listener<F, Fut>(pool: &PgPool, topic: &'static str, channel_id: Uuid, on_payload: F) -> Result<FeedHandle, StoreError>
where
    F: Fn(PgPool, String) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(topic).await?;
    let pool = pool.clone();
    let prefix = channel_id.to_string();

    let task = tokio::spawn(async move {
        loop {
            let notification = match listener.recv().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, topic, channel_id = %prefix, "pg store: listener failed");
                    return;
                }
            };
            let payload = notification.payload();
            if payload == prefix || payload.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.starts_with(':')) {
                on_payload(pool.clone(), payload.to_owned()).await;
            }
        }
    });
    debug!(topic, %channel_id, "pg store: feed opened");
    Ok(FeedHandle::new(move || task.abort()))
}

#[async_trait::async_trait]
impl DurableStore for PgStore {
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chat_channels (id, name, channel_type, project_id) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(&channel.name)
            .bind(channel.channel_type.as_str())
            .bind(&channel.project_id)
            .execute(tx.as_mut())
            .await?;
        for user_id in &channel.participant_ids {
            sqlx::query("INSERT INTO chat_channel_members (channel_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(id)
                .bind(user_id)
                .execute(tx.as_mut())
                .await?;
        }
        tx.commit().await?;

        Ok(Channel {
            id: id.to_string(),
            name: channel.name,
            channel_type: channel.channel_type,
            project_id: channel.project_id,
            participants: channel.participant_ids.into_iter().collect(),
            unread: std::collections::BTreeMap::new(),
            last_message: None,
        })
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Channel, StoreError> {
        let id = parse_id(channel_id)?;
        let row = sqlx::query_as::<_, ChannelRow>("SELECT id, name, channel_type, project_id FROM chat_channels WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))?;
        hydrate_channels(&self.pool, vec![row])
            .await?
            .pop()
            .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))
    }

    async fn get_user_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT c.id, c.name, c.channel_type, c.project_id
             FROM chat_channels c
             JOIN chat_channel_members m ON m.channel_id = c.id
             WHERE m.user_id = $1
             ORDER BY c.name, c.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        hydrate_channels(&self.pool, rows).await
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<MessageAck, StoreError> {
        let channel_id = parse_id(&message.channel_id)?;
        let mut tx = self.pool.begin().await?;

        let member: Option<bool> = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM chat_channel_members WHERE channel_id = $1 AND user_id = $2)
             FROM chat_channels WHERE id = $1",
        )
        .bind(channel_id)
        .bind(&message.sender_id)
        .fetch_optional(tx.as_mut())
        .await?;
        match member {
            None => return Err(StoreError::NotFound(format!("channel {}", message.channel_id))),
            Some(false) => {
                return Err(StoreError::PermissionDenied(format!(
                    "{} is not a member of {}",
                    message.sender_id, message.channel_id
                )));
            }
            Some(true) => {}
        }

        let inserted = sqlx::query_as::<_, (Uuid, i64)>(
            "INSERT INTO chat_messages
                (id, client_id, channel_id, content, sender_id, sender_name, sender_role, channel_type, attachments)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (channel_id, client_id) WHERE client_id IS NOT NULL DO NOTHING
             RETURNING id, ts",
        )
        .bind(Uuid::new_v4())
        .bind(&message.client_id)
        .bind(channel_id)
        .bind(&message.content)
        .bind(&message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.sender_role)
        .bind(message.channel_type.as_str())
        .bind(Json(&message.attachments))
        .fetch_optional(tx.as_mut())
        .await?;

        let Some((id, timestamp)) = inserted else {
            let (id, timestamp) = sqlx::query_as::<_, (Uuid, i64)>(
                "SELECT id, ts FROM chat_messages WHERE channel_id = $1 AND client_id = $2",
            )
            .bind(channel_id)
            .bind(&message.client_id)
            .fetch_one(tx.as_mut())
            .await?;
            tx.commit().await?;
            debug!(%id, client_id = %message.client_id, "pg store: duplicate send collapsed");
            return Ok(MessageAck { id: id.to_string(), timestamp });
        };

        sqlx::query("UPDATE chat_channel_members SET unread = unread + 1 WHERE channel_id = $1 AND user_id <> $2")
            .bind(channel_id)
            .bind(&message.sender_id)
            .execute(tx.as_mut())
            .await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(MESSAGE_NOTIFY)
            .bind(format!("{channel_id}:{id}"))
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;

        Ok(MessageAck { id: id.to_string(), timestamp })
    }

    async fn load_messages(&self, channel_id: &str, pagination: &Pagination) -> Result<MessagePage, StoreError> {
        let channel = parse_id(channel_id)?;
        let (before_ts, before_id) = match &pagination.before {
            Some(cursor) => {
                let (ts, id) = decode_cursor(cursor)?;
                (Some(ts), Some(parse_id(&id)?))
            }
            None => (None, None),
        };
        let limit = i64::try_from(pagination.limit).unwrap_or(i64::MAX - 1);

        let sql = format!(
            "{MESSAGE_SELECT}
             WHERE m.channel_id = $1
               AND ($2::bigint IS NULL OR (m.ts, m.id) < ($2::bigint, $3::uuid))
             GROUP BY m.id
             ORDER BY m.ts DESC, m.id DESC
             LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(channel)
            .bind(before_ts)
            .bind(before_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await?;

        let has_more = rows.len() > pagination.limit;
        let mut messages = rows
            .iter()
            .take(pagination.limit)
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();

        let next_cursor = if has_more {
            messages.first().map(|m| encode_cursor(m.timestamp, &m.id))
        } else {
            None
        };
        Ok(MessagePage { messages, next_cursor })
    }

    async fn mark_message_as_read(&self, channel_id: &str, message_id: &str, user_id: &str) -> Result<(), StoreError> {
        let channel = parse_id(channel_id)?;
        let message = parse_id(message_id)?;
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM chat_messages WHERE id = $1 AND channel_id = $2)")
            .bind(message)
            .bind(channel)
            .fetch_one(tx.as_mut())
            .await?;
        if !exists {
            return Err(StoreError::NotFound(format!("message {message_id}")));
        }

        sqlx::query("INSERT INTO chat_message_reads (message_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(message)
            .bind(user_id)
            .execute(tx.as_mut())
            .await?;
        sqlx::query("UPDATE chat_channel_members SET unread = 0 WHERE channel_id = $1 AND user_id = $2")
            .bind(channel)
            .bind(user_id)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn subscribe_to_messages(&self, channel_id: &str, on_message: MessageCallback) -> Result<FeedHandle, StoreError> {
        let channel = parse_id(channel_id)?;
        spawn_listener(&self.pool, MESSAGE_NOTIFY, channel, move |pool, payload| {
            let on_message = on_message.clone();
            async move {
                let Some(id) = payload.split_once(':').and_then(|(_, id)| Uuid::parse_str(id).ok()) else {
                    return;
                };
                match fetch_message(&pool, id).await {
                    Ok(Some(message)) => on_message(message),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, %id, "pg store: feed fetch failed"),
                }
            }
        })
        .await
    }

    async fn subscribe_to_typing(&self, channel_id: &str, on_typing: TypingCallback) -> Result<FeedHandle, StoreError> {
        let channel = parse_id(channel_id)?;
        spawn_listener(&self.pool, TYPING_NOTIFY, channel, move |pool, _payload| {
            let on_typing = on_typing.clone();
            async move {
                match fetch_typing(&pool, channel).await {
                    Ok(rows) => on_typing(rows),
                    Err(e) => warn!(error = %e, %channel, "pg store: typing fetch failed"),
                }
            }
        })
        .await
    }

    async fn set_typing_indicator(
        &self,
        channel_id: &str,
        user_id: &str,
        user_name: &str,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        let channel = parse_id(channel_id)?;
        let mut tx = self.pool.begin().await?;
        if is_typing {
            sqlx::query(
                "INSERT INTO chat_typing (channel_id, user_id, user_name, ts) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (channel_id, user_id) DO UPDATE SET user_name = EXCLUDED.user_name, ts = EXCLUDED.ts",
            )
            .bind(channel)
            .bind(user_id)
            .bind(user_name)
            .bind(now_ms())
            .execute(tx.as_mut())
            .await?;
        } else {
            sqlx::query("DELETE FROM chat_typing WHERE channel_id = $1 AND user_id = $2")
                .bind(channel)
                .bind(user_id)
                .execute(tx.as_mut())
                .await?;
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(TYPING_NOTIFY)
            .bind(channel.to_string())
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_presence(&self, user_id: &str, status: PresenceStatus, device_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO chat_presence (user_id, device_id, status, last_seen) VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, device_id) DO UPDATE SET status = EXCLUDED.status, last_seen = EXCLUDED.last_seen",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(status.as_str())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
