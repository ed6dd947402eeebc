//! Error taxonomy for the messaging transport and coordination layers.
//!
//! DESIGN
//! ======
//! One `thiserror` enum per layer. `TransportError` and `ProtocolError` are
//! raised by the connection manager and envelope codec, `StoreError` by the
//! durable-store collaborator. `ChatError` is the umbrella surfaced to
//! session callers and error listeners.
//!
//! Every `ChatError` carries a grepable code and a retryable flag via
//! [`ErrorCode`], so UI collaborators can decide whether to offer a retry
//! without string matching.

use std::fmt;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Socket-level failures: open errors, timeouts, sends on a dead link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0}ms")]
    Timeout(u64),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    /// An in-flight connect observed a `disconnect()` and abandoned.
    #[error("connect aborted by disconnect")]
    Aborted,
    #[error("send failed: {0}")]
    Send(String),
}

// =============================================================================
// PROTOCOL
// =============================================================================

/// Malformed or unrecognized envelopes. Isolated per frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {message}")]
    InvalidPayload { kind: &'static str, message: String },
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

// =============================================================================
// STORE
// =============================================================================

/// Failures reported by a [`crate::store::DurableStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

// =============================================================================
// CHAT ERROR
// =============================================================================

/// Umbrella error surfaced to session callers and `on_error` listeners.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Durable persistence failed after the optimistic local append.
    #[error("delivery of message {message_id} failed: {reason}")]
    Delivery { message_id: String, reason: String },
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PermissionDenied(msg) => Self::Permission(msg),
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Store(other.to_string()),
        }
    }
}

impl ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(TransportError::Timeout(_)) => "E_TRANSPORT_TIMEOUT",
            Self::Transport(TransportError::NotConnected) => "E_NOT_CONNECTED",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Protocol(_) => "E_PROTOCOL",
            Self::Delivery { .. } => "E_DELIVERY",
            Self::Permission(_) => "E_PERMISSION",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::InvalidInput(_) => "E_INVALID_INPUT",
            Self::Store(_) => "E_STORE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Transport(TransportError::Aborted) => false,
            Self::Transport(_) | Self::Delivery { .. } | Self::Store(_) => true,
            Self::Protocol(_) | Self::Permission(_) | Self::NotFound(_) | Self::InvalidInput(_) => false,
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
