//! Typing indicators: who is composing in which channel.
//!
//! DESIGN
//! ======
//! Remote indicators live in a `(channel, user)` map. Every START, whether
//! it arrives over the transport or in a durable snapshot, overwrites the
//! entry and re-arms a TTL eviction. STOP removes the entry early, but the
//! TTL is what guarantees removal: a client that vanishes without sending
//! STOP still drops out after `ttl`.
//!
//! Each entry carries a generation. An eviction task only removes the entry
//! it was armed for, so a timer that wakes after a renewal is a no-op.
//!
//! Our own START goes out when typing begins and again on reassertion once
//! `renew_interval` has passed, so peers renew their TTL while we keep
//! typing. It is re-sent when the connection opens, and withdrawn
//! automatically after `idle_timeout` without reassertion.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TypingConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Subscription};
use crate::envelope::{EnvelopeKind, Payload, TypingSignal, now_ms};
use crate::error::ChatError;
use crate::models::{Identity, TypingIndicator};
use crate::store::DurableStore;

const EVENT_CAPACITY: usize = 256;

/// The set of users typing in a channel changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEvent {
    pub channel_id: String,
    pub users: Vec<TypingIndicator>,
}

struct RemoteEntry {
    indicator: TypingIndicator,
    generation: u64,
    eviction: JoinHandle<()>,
}

struct OwnEntry {
    generation: u64,
    idle: JoinHandle<()>,
    /// When START last went out (or was last persisted).
    last_sent: Instant,
}

#[derive(Default)]
struct TypingState {
    remote: HashMap<String, BTreeMap<String, RemoteEntry>>,
    own: HashMap<String, OwnEntry>,
    next_generation: u64,
    was_connected: bool,
}

impl TypingState {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn users(&self, channel_id: &str) -> Vec<TypingIndicator> {
        self.remote
            .get(channel_id)
            .map(|rows| rows.values().map(|e| e.indicator.clone()).collect())
            .unwrap_or_default()
    }
}

struct Inner {
    identity: Identity,
    config: TypingConfig,
    connection: ConnectionManager,
    store: Arc<dyn DurableStore>,
    state: Mutex<TypingState>,
    events: broadcast::Sender<TypingEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct TypingIndicatorAggregator {
    inner: Arc<Inner>,
}

impl TypingIndicatorAggregator {
    #[must_use]
    pub fn new(
        identity: Identity,
        config: TypingConfig,
        connection: ConnectionManager,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            identity,
            config,
            connection,
            store,
            state: Mutex::new(TypingState::default()),
            events,
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut subs = Vec::new();
        for kind in [EnvelopeKind::TypingStart, EnvelopeKind::TypingStop] {
            let weak = Arc::downgrade(&inner);
            subs.push(inner.connection.on_message(kind, move |env| {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                match &env.payload {
                    Payload::TypingStart(signal) => {
                        let indicator = TypingIndicator {
                            user_id: signal.user_id.clone(),
                            user_name: signal.user_name.clone(),
                            channel_id: signal.channel_id.clone(),
                            timestamp: env.timestamp,
                            is_typing: true,
                        };
                        Inner::upsert_remote(&inner, indicator);
                    }
                    Payload::TypingStop(signal) => inner.remove_remote(&signal.channel_id, &signal.user_id, None),
                    _ => {}
                }
                Ok(())
            }));
        }
        let weak = Arc::downgrade(&inner);
        subs.push(inner.connection.on_connection_change(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_change(status);
            }
        }));
        *lock(&inner.subscriptions) = subs;

        Self { inner }
    }

    pub fn events(&self) -> broadcast::Receiver<TypingEvent> {
        self.inner.events.subscribe()
    }

    /// Users currently typing in `channel_id`, excluding ourselves, ordered
    /// by user id.
    #[must_use]
    pub fn typing_users(&self, channel_id: &str) -> Vec<TypingIndicator> {
        lock(&self.inner.state).users(channel_id)
    }

    /// Whether we currently have a START outstanding in `channel_id`.
    #[must_use]
    pub fn is_typing(&self, channel_id: &str) -> bool {
        lock(&self.inner.state).own.contains_key(channel_id)
    }

    /// Announce or withdraw our own typing state.
    ///
    /// START goes out on the transition to typing. Calling again while
    /// typing re-arms the idle timer, and re-sends START once
    /// `renew_interval` has passed since the previous one. The durable
    /// indicator is written whenever a frame goes out.
    ///
    /// # Errors
    ///
    /// Propagates durable store failures. Transport sends are best-effort.
    pub async fn set_typing(&self, channel_id: &str, is_typing: bool) -> Result<(), ChatError> {
        let announce = {
            let mut state = lock(&self.inner.state);
            if is_typing {
                let generation = state.bump();
                let idle = self.inner.spawn_idle_timer(channel_id, generation);
                let now = Instant::now();
                match state.own.entry(channel_id.to_owned()) {
                    Entry::Occupied(mut slot) => {
                        let entry = slot.get_mut();
                        entry.idle.abort();
                        entry.idle = idle;
                        entry.generation = generation;
                        let due = now.duration_since(entry.last_sent) >= self.inner.config.renew_interval;
                        if due {
                            entry.last_sent = now;
                        }
                        due
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(OwnEntry { generation, idle, last_sent: now });
                        true
                    }
                }
            } else {
                match state.own.remove(channel_id) {
                    Some(previous) => {
                        previous.idle.abort();
                        true
                    }
                    None => false,
                }
            }
        };
        if !announce {
            return Ok(());
        }
        self.inner.announce(channel_id, is_typing).await
    }

    /// Fold a durable typing snapshot into the TTL map. Rows for ourselves,
    /// rows that are not typing, and rows older than the TTL are ignored.
    /// Absent users are left to expire.
    pub fn apply_snapshot(&self, channel_id: &str, rows: Vec<TypingIndicator>) {
        let ttl_ms = i64::try_from(self.inner.config.ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(ttl_ms);
        for row in rows {
            if row.channel_id != channel_id || !row.is_typing || row.timestamp < cutoff {
                continue;
            }
            Inner::upsert_remote(&self.inner, row);
        }
    }

    /// Cancel every timer, withdraw our own indicators over the transport,
    /// and detach from the connection.
    pub fn shutdown(&self) {
        let (own, remote) = {
            let mut state = lock(&self.inner.state);
            (std::mem::take(&mut state.own), std::mem::take(&mut state.remote))
        };
        for (channel_id, entry) in own {
            entry.idle.abort();
            self.inner.send_signal(&channel_id, false);
        }
        for entry in remote.into_values().flat_map(BTreeMap::into_values) {
            entry.eviction.abort();
        }
        for sub in lock(&self.inner.subscriptions).drain(..) {
            sub.unsubscribe();
        }
        debug!(user_id = %self.inner.identity.user_id, "typing: shut down");
    }
}

impl Inner {
    fn emit(&self, channel_id: &str, users: Vec<TypingIndicator>) {
        let _ = self.events.send(TypingEvent { channel_id: channel_id.to_owned(), users });
    }

    fn send_signal(&self, channel_id: &str, is_typing: bool) {
        if !self.connection.is_connected() {
            return;
        }
        let signal = TypingSignal {
            channel_id: channel_id.to_owned(),
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
        };
        let payload = if is_typing { Payload::TypingStart(signal) } else { Payload::TypingStop(signal) };
        if let Err(e) = self.connection.send(payload) {
            debug!(%channel_id, error = %e, "typing: signal not sent");
        }
    }

    async fn announce(&self, channel_id: &str, is_typing: bool) -> Result<(), ChatError> {
        self.send_signal(channel_id, is_typing);
        self.store
            .set_typing_indicator(channel_id, &self.identity.user_id, &self.identity.user_name, is_typing)
            .await?;
        Ok(())
    }

    fn spawn_idle_timer(self: &Arc<Self>, channel_id: &str, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let idle = self.config.idle_timeout;
        let channel_id = channel_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(inner) = weak.upgrade() {
                inner.idle_expired(&channel_id, generation).await;
            }
        })
    }

    /// Re-send START for every channel we are still typing in once the
    /// connection opens; peers may have evicted us while we were away.
    fn on_connection_change(&self, status: &ConnectionStatus) {
        let channels = {
            let mut state = lock(&self.state);
            let opened = status.connected && !state.was_connected;
            state.was_connected = status.connected;
            if !opened {
                return;
            }
            let now = Instant::now();
            state
                .own
                .iter_mut()
                .map(|(channel_id, entry)| {
                    entry.last_sent = now;
                    channel_id.clone()
                })
                .collect::<Vec<_>>()
        };
        for channel_id in channels {
            debug!(%channel_id, "typing: re-sending start after connect");
            self.send_signal(&channel_id, true);
        }
    }

    async fn idle_expired(&self, channel_id: &str, generation: u64) {
        {
            let mut state = lock(&self.state);
            if state.own.get(channel_id).is_none_or(|e| e.generation != generation) {
                return;
            }
            state.own.remove(channel_id);
        }
        debug!(%channel_id, "typing: idle, withdrawing");
        if let Err(e) = self.announce(channel_id, false).await {
            warn!(%channel_id, error = %e, "typing: idle stop not persisted");
        }
    }

    fn upsert_remote(this: &Arc<Self>, indicator: TypingIndicator) {
        if indicator.user_id == this.identity.user_id {
            return;
        }
        let channel_id = indicator.channel_id.clone();
        let user_id = indicator.user_id.clone();
        let (users, fresh) = {
            let mut state = lock(&this.state);
            let generation = state.bump();
            let eviction = Self::spawn_eviction(this, &channel_id, &user_id, generation);
            let previous = state
                .remote
                .entry(channel_id.clone())
                .or_default()
                .insert(user_id.clone(), RemoteEntry { indicator, generation, eviction });
            let fresh = previous.is_none();
            if let Some(previous) = previous {
                previous.eviction.abort();
            }
            (state.users(&channel_id), fresh)
        };
        if fresh {
            info!(%channel_id, %user_id, "typing: started");
            this.emit(&channel_id, users);
        }
    }

    /// Remove `(channel, user)`. With `generation`, only if it still
    /// matches.
    fn remove_remote(&self, channel_id: &str, user_id: &str, generation: Option<u64>) {
        let users = {
            let mut state = lock(&self.state);
            let Some(rows) = state.remote.get_mut(channel_id) else {
                return;
            };
            if generation.is_some_and(|g| rows.get(user_id).is_none_or(|e| e.generation != g)) {
                return;
            }
            let Some(removed) = rows.remove(user_id) else {
                return;
            };
            if generation.is_none() {
                removed.eviction.abort();
            }
            if rows.is_empty() {
                state.remote.remove(channel_id);
            }
            state.users(channel_id)
        };
        info!(%channel_id, %user_id, expired = generation.is_some(), "typing: stopped");
        self.emit(channel_id, users);
    }

    fn spawn_eviction(this: &Arc<Self>, channel_id: &str, user_id: &str, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(this);
        let ttl = this.config.ttl;
        let (channel_id, user_id) = (channel_id.to_owned(), user_id.to_owned());
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.remove_remote(&channel_id, &user_id, Some(generation));
            }
        })
    }
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
