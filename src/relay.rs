//! Relay server: the realtime fan-out peer the connection manager talks to.
//!
//! DESIGN
//! ======
//! Each websocket gets a client id and a bounded `mpsc` sender in the
//! registry. The connection task `select!`s between socket reads and frames
//! queued for it by peers.
//!
//! Frame handling is split in two: `process_inbound_text`
//! decides an [`Outcome`] and the dispatch layer delivers it. The relay
//! keeps no chat state beyond the registry. Channel membership is read from
//! the durable store on every channel-scoped frame, so fan-out follows the
//! same permissions the store enforces.
//!
//! ROUTING
//! =======
//! - HEARTBEAT: echoed to the sender.
//! - MESSAGE_SENT: stamped with the server clock and fanned out to the
//!   channel's members as MESSAGE_RECEIVED. The sender gets a DELIVERED
//!   receipt if another member was reached.
//! - TYPING_* and MESSAGE_STATUS_UPDATE: relayed unchanged to the channel's
//!   members.
//! - PRESENCE_UPDATE: relayed unchanged to every client.
//! - Frames naming a user other than the connection's, frames for channels
//!   the user is not a member of, client-sent MESSAGE_RECEIVED, and
//!   malformed frames are logged and dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::{RwLock, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeKind, Payload, StatusUpdate, now_ms};
use crate::models::{Message as ChatMessage, MessageStatus};
use crate::store::DurableStore;

/// Per-client outbound queue depth. A full queue drops frames for that
/// client only.
const CLIENT_QUEUE: usize = 256;

struct Client {
    user_id: String,
    tx: mpsc::Sender<Envelope>,
}

/// Shared relay state, injected into handlers via the `State` extractor.
#[derive(Clone)]
pub struct RelayState {
    clients: Arc<RwLock<HashMap<Uuid, Client>>>,
    store: Arc<dyn DurableStore>,
}

impl RelayState {
    /// Relay state that resolves channel membership through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { clients: Arc::default(), store }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn register(&self, user_id: &str) -> (Uuid, mpsc::Receiver<Envelope>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        self.clients
            .write()
            .await
            .insert(client_id, Client { user_id: user_id.to_owned(), tx });
        (client_id, rx)
    }

    async fn unregister(&self, client_id: Uuid) {
        self.clients.write().await.remove(&client_id);
    }

    /// Members of `channel_id`, if `user_id` is one of them.
    async fn channel_members(&self, channel_id: &str, user_id: &str) -> Option<BTreeSet<String>> {
        match self.store.get_channel(channel_id).await {
            Ok(channel) if channel.participants.contains(user_id) => Some(channel.participants),
            Ok(_) => {
                warn!(%channel_id, %user_id, "relay: sender is not a channel member, frame dropped");
                None
            }
            Err(e) => {
                warn!(%channel_id, %user_id, error = %e, "relay: channel lookup failed, frame dropped");
                None
            }
        }
    }

    /// Queue `env` for every client except `exclude`, restricted to
    /// `members` when given. Returns how many clients of users other than
    /// `sender` accepted it.
    async fn broadcast(&self, env: &Envelope, exclude: Uuid, sender: &str, members: Option<&BTreeSet<String>>) -> usize {
        let clients = self.clients.read().await;
        let mut reached = 0;
        for (id, client) in clients.iter() {
            if *id == exclude || members.is_some_and(|m| !m.contains(&client.user_id)) {
                continue;
            }
            match client.tx.try_send(env.clone()) {
                Ok(()) if client.user_id != sender => reached += 1,
                Ok(()) => {}
                Err(e) => {
                    debug!(client_id = %id, user_id = %client.user_id, error = %e, "relay: peer queue rejected frame");
                }
            }
        }
        reached
    }
}

/// Router with the websocket endpoint and a health check.
pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Who a relayed frame goes to.
enum Audience {
    Everyone,
    /// Members of the channel; the sender must be one of them.
    Channel(String),
}

/// What the dispatch layer should deliver for one inbound frame.
enum Outcome {
    /// Send to the sender only.
    Reply(Envelope),
    /// Send to the audience, never back to the sending connection.
    Relay { env: Envelope, audience: Audience },
    /// Send to the channel's members; if another member was reached, send
    /// `receipt` to the sender.
    RelayWithReceipt { relay: Envelope, receipt: Envelope, channel_id: String },
    Drop,
}

// =============================================================================
// UPGRADE
// =============================================================================

async fn handle_ws(
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = params.get("user_id").filter(|u| !u.trim().is_empty()).cloned() else {
        return (StatusCode::UNAUTHORIZED, "user_id required").into_response();
    };
    ws.on_upgrade(move |socket| run_ws(socket, state, user_id))
}

async fn run_ws(mut socket: WebSocket, state: RelayState, user_id: String) {
    let (client_id, mut client_rx) = state.register(&user_id).await;
    info!(%client_id, %user_id, "relay: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, client_id, &user_id, &text).await;
                        if send_all(&mut socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(env) = client_rx.recv() => {
                if send_envelope(&mut socket, &env).await.is_err() {
                    break;
                }
            }
        }
    }

    state.unregister(client_id).await;
    info!(%client_id, %user_id, "relay: client disconnected");
}

async fn send_envelope(socket: &mut WebSocket, env: &Envelope) -> Result<(), axum::Error> {
    socket.send(Message::Text(env.encode().into())).await
}

async fn send_all(socket: &mut WebSocket, envs: &[Envelope]) -> Result<(), axum::Error> {
    for env in envs {
        send_envelope(socket, env).await?;
    }
    Ok(())
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Decode one inbound text frame, route it, and return frames for the
/// sender.
pub(crate) async fn process_inbound_text(state: &RelayState, client_id: Uuid, user_id: &str, text: &str) -> Vec<Envelope> {
    let env = match Envelope::decode(text) {
        Ok(env) => env,
        Err(e) => {
            warn!(%client_id, error = %e, "relay: malformed frame dropped");
            return Vec::new();
        }
    };
    if env.kind() != EnvelopeKind::Heartbeat {
        debug!(%client_id, kind = env.kind().as_str(), id = %env.message_id, "relay: recv frame");
    }

    match route(env, user_id) {
        Outcome::Reply(env) => vec![env],
        Outcome::Relay { env, audience: Audience::Everyone } => {
            state.broadcast(&env, client_id, user_id, None).await;
            Vec::new()
        }
        Outcome::Relay { env, audience: Audience::Channel(channel_id) } => {
            if let Some(members) = state.channel_members(&channel_id, user_id).await {
                state.broadcast(&env, client_id, user_id, Some(&members)).await;
            }
            Vec::new()
        }
        Outcome::RelayWithReceipt { relay, receipt, channel_id } => {
            let Some(members) = state.channel_members(&channel_id, user_id).await else {
                return Vec::new();
            };
            let reached = state.broadcast(&relay, client_id, user_id, Some(&members)).await;
            if reached > 0 { vec![receipt] } else { Vec::new() }
        }
        Outcome::Drop => Vec::new(),
    }
}

fn route(env: Envelope, user_id: &str) -> Outcome {
    let claimed = match &env.payload {
        Payload::Heartbeat | Payload::MessageReceived(_) => None,
        Payload::MessageSent(message) => Some(message.sender_id.as_str()),
        Payload::TypingStart(signal) | Payload::TypingStop(signal) => Some(signal.user_id.as_str()),
        Payload::PresenceUpdate(signal) => Some(signal.user_id.as_str()),
        Payload::MessageStatusUpdate(update) => update.user_id.as_deref(),
    };
    if let Some(claimed) = claimed.filter(|c| *c != user_id) {
        warn!(%claimed, %user_id, kind = env.kind().as_str(), "relay: user mismatch, frame dropped");
        return Outcome::Drop;
    }

    let env = match env.payload {
        Payload::Heartbeat => return Outcome::Reply(Envelope::heartbeat()),
        Payload::MessageReceived(_) => {
            debug!(%user_id, "relay: client-sent MESSAGE_RECEIVED dropped");
            return Outcome::Drop;
        }
        Payload::MessageSent(message) => return fan_out_message(message),
        payload => Envelope { payload, timestamp: env.timestamp, message_id: env.message_id },
    };
    let audience = match &env.payload {
        Payload::TypingStart(signal) | Payload::TypingStop(signal) => Audience::Channel(signal.channel_id.clone()),
        Payload::MessageStatusUpdate(update) => Audience::Channel(update.channel_id.clone()),
        _ => Audience::Everyone,
    };
    Outcome::Relay { env, audience }
}

fn fan_out_message(mut message: ChatMessage) -> Outcome {
    message.timestamp = now_ms();
    message.advance(MessageStatus::Sent);
    let receipt = Envelope::new(Payload::MessageStatusUpdate(StatusUpdate {
        channel_id: message.channel_id.clone(),
        message_id: message.id.clone(),
        status: MessageStatus::Delivered,
        user_id: None,
    }));
    let channel_id = message.channel_id.clone();
    Outcome::RelayWithReceipt { relay: Envelope::new(Payload::MessageReceived(message)), receipt, channel_id }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
