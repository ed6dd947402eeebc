//! Presence tracking: per-device status with a derived per-user view.
//!
//! DESIGN
//! ======
//! Each device is the only writer of its own `(user, device)` entry, so
//! entries are resolved by last-write-wins on the sender's timestamp. An
//! update older than the stored entry is dropped regardless of arrival
//! order.
//!
//! The per-user status is never stored: `get_user_presence` picks the most
//! available device at read time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection::{ConnectionManager, ConnectionStatus, Subscription};
use crate::envelope::{EnvelopeKind, Payload, PresenceSignal, now_ms};
use crate::error::ChatError;
use crate::models::{EffectivePresence, Identity, PresenceStatus, UserPresence};
use crate::store::DurableStore;

const EVENT_CAPACITY: usize = 256;

/// A device entry was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub presence: UserPresence,
}

#[derive(Default)]
struct PresenceState {
    /// user id -> device id -> entry.
    devices: BTreeMap<String, HashMap<String, UserPresence>>,
    /// Last status we announced, re-sent after a reconnect.
    own: Option<PresenceStatus>,
    was_connected: bool,
    ever_connected: bool,
}

impl PresenceState {
    /// Last-write-wins. Returns whether the entry was stored.
    fn apply(&mut self, incoming: UserPresence) -> bool {
        let devices = self.devices.entry(incoming.user_id.clone()).or_default();
        if let Some(existing) = devices.get(&incoming.device_id) {
            if existing.last_seen > incoming.last_seen {
                return false;
            }
        }
        devices.insert(incoming.device_id.clone(), incoming);
        true
    }

    fn effective(&self, user_id: &str) -> Option<EffectivePresence> {
        let devices = self.devices.get(user_id)?;
        let best = devices
            .values()
            .max_by_key(|p| (p.status.availability(), p.last_seen))?;
        Some(EffectivePresence {
            user_id: user_id.to_owned(),
            status: best.status,
            last_seen: devices.values().map(|p| p.last_seen).max().unwrap_or(best.last_seen),
            device_count: devices.len(),
        })
    }
}

struct Inner {
    identity: Identity,
    connection: ConnectionManager,
    store: Arc<dyn DurableStore>,
    state: Mutex<PresenceState>,
    events: broadcast::Sender<PresenceEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<Inner>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(identity: Identity, connection: ConnectionManager, store: Arc<dyn DurableStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            identity,
            connection,
            store,
            state: Mutex::new(PresenceState::default()),
            events,
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let updates = inner.connection.on_message(EnvelopeKind::PresenceUpdate, move |env| {
            if let (Payload::PresenceUpdate(signal), Some(inner)) = (&env.payload, weak.upgrade()) {
                inner.accept(UserPresence {
                    user_id: signal.user_id.clone(),
                    device_id: signal.device_id.clone(),
                    status: signal.status,
                    last_seen: signal.timestamp,
                });
            }
            Ok(())
        });
        let weak = Arc::downgrade(&inner);
        let reconnects = inner.connection.on_connection_change(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_change(status);
            }
        });
        *lock(&inner.subscriptions) = vec![updates, reconnects];

        Self { inner }
    }

    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Publish our own status for this device: recorded locally, pushed over
    /// the transport when connected, and persisted.
    ///
    /// # Errors
    ///
    /// Propagates durable store failures.
    pub async fn update_presence(&self, status: PresenceStatus) -> Result<(), ChatError> {
        let identity = &self.inner.identity;
        let timestamp = now_ms();
        lock(&self.inner.state).own = Some(status);
        self.inner.accept(UserPresence {
            user_id: identity.user_id.clone(),
            device_id: identity.device_id.clone(),
            status,
            last_seen: timestamp,
        });
        self.inner.publish(status, timestamp);
        self.inner
            .store
            .update_presence(&identity.user_id, status, &identity.device_id)
            .await?;
        info!(user_id = %identity.user_id, status = status.as_str(), "presence: updated");
        Ok(())
    }

    /// Most-available status across the user's devices.
    #[must_use]
    pub fn get_user_presence(&self, user_id: &str) -> Option<EffectivePresence> {
        lock(&self.inner.state).effective(user_id)
    }

    /// One derived entry per known user, ordered by user id.
    #[must_use]
    pub fn get_all_presences(&self) -> Vec<EffectivePresence> {
        let state = lock(&self.inner.state);
        state.devices.keys().filter_map(|user_id| state.effective(user_id)).collect()
    }

    /// Raw per-device entries for `user_id`, ordered by device id.
    #[must_use]
    pub fn get_device_presences(&self, user_id: &str) -> Vec<UserPresence> {
        let mut devices: Vec<UserPresence> = lock(&self.inner.state)
            .devices
            .get(user_id)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn shutdown(&self) {
        for sub in lock(&self.inner.subscriptions).drain(..) {
            sub.unsubscribe();
        }
    }
}

impl Inner {
    fn accept(&self, presence: UserPresence) {
        let stored = lock(&self.state).apply(presence.clone());
        if stored {
            let _ = self.events.send(PresenceEvent { presence });
        } else {
            debug!(
                user_id = %presence.user_id,
                device_id = %presence.device_id,
                last_seen = presence.last_seen,
                "presence: stale update dropped"
            );
        }
    }

    fn publish(&self, status: PresenceStatus, timestamp: i64) {
        if !self.connection.is_connected() {
            return;
        }
        let signal = PresenceSignal {
            user_id: self.identity.user_id.clone(),
            device_id: self.identity.device_id.clone(),
            status,
            timestamp,
        };
        if let Err(e) = self.connection.send(Payload::PresenceUpdate(signal)) {
            debug!(error = %e, "presence: update not pushed");
        }
    }

    fn on_connection_change(&self, status: &ConnectionStatus) {
        let announce = {
            let mut state = lock(&self.state);
            let reconnected = status.connected && !state.was_connected && state.ever_connected;
            state.ever_connected |= status.connected;
            state.was_connected = status.connected;
            if reconnected { state.own } else { None }
        };
        if let Some(own) = announce {
            info!(status = own.as_str(), "presence: re-announcing after reconnect");
            self.publish(own, now_ms());
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
