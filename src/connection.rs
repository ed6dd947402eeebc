//! Connection manager: one live socket with lifecycle, reconnect, heartbeat
//! and typed dispatch.
//!
//! ARCHITECTURE
//! ============
//! `ConnectionManager` is a cheap-to-clone handle over shared state. It owns
//! exactly one [`Link`] at a time and three kinds of background task:
//! the reader (dispatch loop), the heartbeat ticker, and at most one pending
//! reconnect. All three are cancelled by [`ConnectionManager::disconnect`].
//!
//! STATE MACHINE
//! =============
//! `Disconnected -> Connecting -> Connected`
//! `Connected --normal close--> Disconnected`
//! `Connected --abnormal close--> Reconnecting -> Connecting -> ...`
//! Once `max_reconnect_attempts` is spent the manager rests in
//! `Disconnected` with `last_error` set until `connect()` is called again.
//!
//! DESIGN
//! ======
//! Every transition bumps a generation counter. Timers and in-flight opens
//! capture the generation they were started under and become no-ops when it
//! no longer matches, so a stale callback can never act on a superseded
//! link. Listeners are always invoked outside the state lock.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConnectionConfig, MAX_RECONNECT_DELAY};
use crate::envelope::{Envelope, EnvelopeKind, Payload};
use crate::error::{ChatError, TransportError};
use crate::transport::{Connector, Inbound, Link, NORMAL_CLOSURE, Outbound};

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Observable connection state. Mutated only by the manager's transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    /// True while a reconnect attempt is scheduled or in flight.
    pub reconnecting: bool,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub phase: ConnectionPhase,
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `interval * 2^(attempt-1)`, capped at 30s.
#[must_use]
pub fn backoff_delay(interval: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    interval
        .checked_mul(1u32 << exponent)
        .map_or(MAX_RECONNECT_DELAY, |d| d.min(MAX_RECONNECT_DELAY))
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

pub type MessageHandler = Arc<dyn Fn(&Envelope) -> Result<(), ChatError> + Send + Sync>;
pub type StatusListener = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&ChatError) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    message: HashMap<EnvelopeKind, Vec<(u64, MessageHandler)>>,
    status: Vec<(u64, StatusListener)>,
    error: Vec<(u64, ErrorListener)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        for handlers in self.message.values_mut() {
            handlers.retain(|(h, _)| *h != id);
        }
        self.status.retain(|(h, _)| *h != id);
        self.error.retain(|(h, _)| *h != id);
    }
}

/// Handle returned by every `on_*` registration.
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpenKind {
    /// Caller-initiated `connect()`. Failure rests in `Disconnected`.
    Explicit,
    /// Scheduled reconnect. Failure continues the backoff chain.
    Retry,
}

#[derive(Default)]
struct LinkState {
    status: ConnectionStatus,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<LinkState>,
    registry: Arc<Mutex<Registry>>,
}

/// Owns one transport link and its lifecycle.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(LinkState::default()),
                registry: Arc::new(Mutex::new(Registry::default())),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).status.phase == ConnectionPhase::Connected
    }

    /// Open the transport. No-op when already connected.
    ///
    /// Supersedes any pending reconnect or in-flight attempt.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] / [`TransportError::Timeout`] if
    /// the socket cannot be opened within `timeout` (also broadcast to error
    /// listeners), or [`TransportError::Aborted`] if `disconnect()` ran while
    /// the open was in flight.
    pub async fn connect(&self) -> Result<(), ChatError> {
        let (generation, snapshot) = {
            let mut st = lock(&self.inner.state);
            if st.status.phase == ConnectionPhase::Connected {
                return Ok(());
            }
            if let Some(pending) = st.reconnect.take() {
                pending.abort();
            }
            st.generation += 1;
            st.status.phase = ConnectionPhase::Connecting;
            st.status.reconnecting = false;
            (st.generation, st.status.clone())
        };
        info!(url = %self.inner.config.url, generation, "connection: connecting");
        self.inner.notify_status(&snapshot);
        self.inner.open(generation, OpenKind::Explicit).await
    }

    /// Close with a normal-closure code and cancel every timer.
    ///
    /// Idempotent. Suppresses auto-reconnect. An in-flight `connect()`
    /// observes the close and returns [`TransportError::Aborted`].
    pub fn disconnect(&self) {
        let (outbound, handles, snapshot) = {
            let mut st = lock(&self.inner.state);
            let was_idle = st.status.phase == ConnectionPhase::Disconnected
                && st.outbound.is_none()
                && st.reconnect.is_none()
                && !st.status.reconnecting;
            st.generation += 1;
            st.status.phase = ConnectionPhase::Disconnected;
            st.status.connected = false;
            st.status.reconnecting = false;
            st.status.attempt_count = 0;
            let handles = [st.reader.take(), st.heartbeat.take(), st.reconnect.take()];
            (st.outbound.take(), handles, (!was_idle).then(|| st.status.clone()))
        };

        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close(NORMAL_CLOSURE));
        }
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
        if let Some(snapshot) = snapshot {
            info!(url = %self.inner.config.url, "connection: disconnected by caller");
            self.inner.notify_status(&snapshot);
        }
    }

    /// Wrap `payload` in an envelope and write it. Never suspends, never
    /// retries. Returns the envelope's message id.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless connected, or
    /// [`TransportError::Send`] if the link closed underneath.
    pub fn send(&self, payload: Payload) -> Result<String, ChatError> {
        let tx = {
            let st = lock(&self.inner.state);
            if st.status.phase == ConnectionPhase::Connected {
                st.outbound.clone()
            } else {
                None
            }
        };
        let Some(tx) = tx else {
            return Err(TransportError::NotConnected.into());
        };

        let env = Envelope::new(payload);
        tx.send(Outbound::Text(env.encode()))
            .map_err(|e| TransportError::Send(e.to_string()))?;
        debug!(kind = env.kind().as_str(), id = %env.message_id, "connection: sent");
        Ok(env.message_id)
    }

    // =========================================================================
    // REGISTRIES
    // =========================================================================

    pub fn on_connection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.registry);
        let id = registry.next_id();
        registry.status.push((id, Arc::new(listener)));
        self.subscription(id)
    }

    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChatError) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.registry);
        let id = registry.next_id();
        registry.error.push((id, Arc::new(listener)));
        self.subscription(id)
    }

    /// Register a handler for one envelope type. Handlers for the same type
    /// run in registration order. HEARTBEAT handlers are never invoked.
    pub fn on_message<F>(&self, kind: EnvelopeKind, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> Result<(), ChatError> + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.registry);
        let id = registry.next_id();
        registry
            .message
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        self.subscription(id)
    }

    fn subscription(&self, id: u64) -> Subscription {
        Subscription { id, registry: Arc::downgrade(&self.inner.registry) }
    }
}

// =============================================================================
// TRANSITIONS
// =============================================================================

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        lock(&self.state)
    }

    async fn open(self: &Arc<Self>, generation: u64, kind: OpenKind) -> Result<(), ChatError> {
        let opened = tokio::time::timeout(self.config.timeout, self.connector.open(&self.config.url)).await;
        let link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(self.open_failed(generation, kind, e)),
            Err(_) => {
                let ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
                return Err(self.open_failed(generation, kind, TransportError::Timeout(ms)));
            }
        };

        let Link { tx, rx } = link;
        let snapshot = {
            let mut st = self.lock_state();
            if st.generation != generation || st.status.phase != ConnectionPhase::Connecting {
                drop(st);
                let _ = tx.send(Outbound::Close(NORMAL_CLOSURE));
                debug!(generation, "connection: open abandoned after disconnect");
                return Err(TransportError::Aborted.into());
            }
            st.status = ConnectionStatus {
                connected: true,
                reconnecting: false,
                attempt_count: 0,
                last_error: None,
                phase: ConnectionPhase::Connected,
            };
            st.outbound = Some(tx.clone());
            st.reader = Some(tokio::spawn(Arc::clone(self).read_loop(generation, rx)));
            st.heartbeat = Some(tokio::spawn(heartbeat_loop(self.config.heartbeat_interval, generation, tx)));
            // A retry reaches here from inside its own task: detach, don't abort.
            st.reconnect.take();
            st.status.clone()
        };
        info!(url = %self.config.url, generation, "connection: open");
        self.notify_status(&snapshot);
        Ok(())
    }

    fn open_failed(self: &Arc<Self>, generation: u64, kind: OpenKind, err: TransportError) -> ChatError {
        let snapshot = {
            let mut st = self.lock_state();
            if st.generation != generation {
                debug!(generation, error = %err, "connection: stale open failure ignored");
                return TransportError::Aborted.into();
            }
            st.status.connected = false;
            st.status.last_error = Some(err.to_string());
            match kind {
                OpenKind::Explicit => {
                    st.status.phase = ConnectionPhase::Disconnected;
                    st.status.reconnecting = false;
                }
                OpenKind::Retry => self.schedule_reconnect(&mut st),
            }
            st.status.clone()
        };

        warn!(url = %self.config.url, error = %err, ?kind, "connection: open failed");
        let err = ChatError::from(err);
        if kind == OpenKind::Explicit {
            self.notify_error(&err);
        }
        self.notify_status(&snapshot);
        err
    }

    /// Schedule the next attempt, or rest in `Disconnected` when spent.
    /// Caller holds the state lock.
    fn schedule_reconnect(self: &Arc<Self>, st: &mut LinkState) {
        let max = self.config.max_reconnect_attempts;
        if st.status.attempt_count >= max {
            let cause = st
                .status
                .last_error
                .take()
                .unwrap_or_else(|| "connection lost".to_owned());
            warn!(attempts = st.status.attempt_count, %cause, "connection: reconnect attempts exhausted");
            st.status.phase = ConnectionPhase::Disconnected;
            st.status.reconnecting = false;
            st.status.last_error = Some(format!("gave up after {max} reconnect attempts: {cause}"));
            return;
        }

        st.status.attempt_count += 1;
        let attempt = st.status.attempt_count;
        let delay = backoff_delay(self.config.reconnect_interval, attempt);
        st.generation += 1;
        let generation = st.generation;
        st.status.phase = ConnectionPhase::Reconnecting;
        st.status.reconnecting = true;

        info!(attempt, max, delay_ms = delay.as_millis(), "connection: reconnect scheduled");
        let inner = Arc::clone(self);
        st.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.retry(generation).await;
        }));
    }

    async fn retry(self: Arc<Self>, generation: u64) {
        let snapshot = {
            let mut st = self.lock_state();
            if st.generation != generation || st.status.phase != ConnectionPhase::Reconnecting {
                return;
            }
            st.status.phase = ConnectionPhase::Connecting;
            st.status.clone()
        };
        debug!(attempt = snapshot.attempt_count, "connection: reconnect attempt");
        self.notify_status(&snapshot);
        let _ = self.open(generation, OpenKind::Retry).await;
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        let snapshot = {
            let mut st = self.lock_state();
            if st.generation != generation || st.status.phase != ConnectionPhase::Connected {
                return;
            }
            if let Some(heartbeat) = st.heartbeat.take() {
                heartbeat.abort();
            }
            st.outbound = None;
            st.reader.take();
            st.status.connected = false;

            if code == Some(NORMAL_CLOSURE) {
                info!(generation, "connection: closed normally");
                st.status.phase = ConnectionPhase::Disconnected;
                st.status.reconnecting = false;
            } else {
                let err = TransportError::Closed { code, reason };
                warn!(generation, error = %err, "connection: closed abnormally");
                st.status.last_error = Some(err.to_string());
                self.schedule_reconnect(&mut st);
            }
            st.status.clone()
        };
        self.notify_status(&snapshot);
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// One frame is fully dispatched before the next is read.
    async fn read_loop(self: Arc<Self>, generation: u64, mut rx: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Text(text) => self.dispatch(&text),
                Inbound::Closed { code, reason } => {
                    self.handle_close(generation, code, reason);
                    return;
                }
            }
        }
        self.handle_close(generation, None, "transport dropped".to_owned());
    }

    fn dispatch(&self, text: &str) {
        let env = match Envelope::decode(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "connection: dropping malformed frame");
                self.notify_error(&ChatError::Protocol(e));
                return;
            }
        };

        if env.kind() == EnvelopeKind::Heartbeat {
            trace!(id = %env.message_id, "connection: heartbeat received");
            return;
        }

        let handlers: Vec<MessageHandler> = lock(&self.registry)
            .message
            .get(&env.kind())
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(kind = env.kind().as_str(), "connection: no handler registered");
        }

        for handler in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&env))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(kind = env.kind().as_str(), id = %env.message_id, error = %e, "connection: handler failed");
                }
                Err(_) => {
                    error!(kind = env.kind().as_str(), id = %env.message_id, "connection: handler panicked");
                }
            }
        }
    }

    fn notify_status(&self, status: &ConnectionStatus) {
        let listeners: Vec<StatusListener> = lock(&self.registry)
            .status
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(status);
        }
    }

    fn notify_error(&self, err: &ChatError) {
        let listeners: Vec<ErrorListener> = lock(&self.registry)
            .error
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(err);
        }
    }
}

async fn heartbeat_loop(period: Duration, generation: u64, tx: mpsc::UnboundedSender<Outbound>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if tx.send(Outbound::Text(Envelope::heartbeat().encode())).is_err() {
            debug!(generation, "connection: heartbeat stopped, link closed");
            return;
        }
        trace!(generation, "connection: heartbeat sent");
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
