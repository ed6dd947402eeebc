//! Realtime project chat: a single-socket connection manager with
//! reconnect and heartbeat, optimistic messaging reconciled against a
//! durable store, TTL-bounded typing indicators, and per-device presence.
//!
//! [`session::ChatSession`] wires the pieces together for one user.
//! [`relay`] is the websocket fan-out server the sessions connect to.

pub mod config;
pub mod connection;
pub mod db;
pub mod envelope;
pub mod error;
pub mod messaging;
pub mod models;
pub mod presence;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;
pub mod typing;
