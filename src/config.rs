//! Connection and session configuration.
//!
//! DESIGN
//! ======
//! `ConnectionConfig` is supplied whole at construction; the transport layer
//! applies no defaults of its own. Defaults live one level up, in
//! `SessionConfig::from_env`, which is the application's config loader.

use std::time::Duration;

use crate::error::ChatError;

pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TYPING_TTL_MS: u64 = 5_000;
pub const DEFAULT_TYPING_IDLE_MS: u64 = 3_000;
pub const DEFAULT_TYPING_RENEW_MS: u64 = 2_500;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;

/// Upper bound on any single reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(30_000);

// =============================================================================
// CONNECTION
// =============================================================================

/// Immutable transport settings. All fields are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
}

impl ConnectionConfig {
    /// Reject configs the connection manager cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidInput`] for an empty url or a zero
    /// reconnect interval, heartbeat interval, or timeout.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.url.trim().is_empty() {
            return Err(ChatError::InvalidInput("connection url is empty".into()));
        }
        for (name, value) in [
            ("reconnect_interval", self.reconnect_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("timeout", self.timeout),
        ] {
            if value.is_zero() {
                return Err(ChatError::InvalidInput(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

// =============================================================================
// COORDINATION LAYERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// Remote indicators are evicted this long after their last START.
    pub ttl: Duration,
    /// Our own START is withdrawn after this long without reassertion.
    pub idle_timeout: Duration,
    /// While we keep typing, START is re-sent once this much time has passed
    /// since the last one. Must stay below `ttl`.
    pub renew_interval: Duration,
}

impl TypingConfig {
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidInput`] if `renew_interval` is zero or not
    /// shorter than `ttl`; peers would drop us between renewals.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.renew_interval.is_zero() || self.renew_interval >= self.ttl {
            return Err(ChatError::InvalidInput("typing renew_interval must be non-zero and below ttl".into()));
        }
        Ok(())
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
            idle_timeout: Duration::from_millis(DEFAULT_TYPING_IDLE_MS),
            renew_interval: Duration::from_millis(DEFAULT_TYPING_RENEW_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagingConfig {
    /// SENT messages without a DELIVERED/READ receipt by then are flagged.
    pub ack_timeout: Duration,
    /// Page size used for reconnect catch-up fetches.
    pub history_page_size: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub typing: TypingConfig,
    pub messaging: MessagingConfig,
}

impl SessionConfig {
    /// Session config with default coordination settings for `connection`.
    #[must_use]
    pub fn new(connection: ConnectionConfig) -> Self {
        Self { connection, typing: TypingConfig::default(), messaging: MessagingConfig::default() }
    }

    /// Build session config from environment variables.
    ///
    /// Required:
    /// - `CHAT_WS_URL`
    ///
    /// Optional (defaults in parentheses):
    /// - `CHAT_RECONNECT_INTERVAL_MS` (1000)
    /// - `CHAT_MAX_RECONNECT_ATTEMPTS` (5)
    /// - `CHAT_HEARTBEAT_INTERVAL_MS` (30000)
    /// - `CHAT_CONNECT_TIMEOUT_MS` (10000)
    /// - `CHAT_TYPING_TTL_MS` (5000)
    /// - `CHAT_TYPING_IDLE_MS` (3000)
    /// - `CHAT_TYPING_RENEW_MS` (2500)
    /// - `CHAT_ACK_TIMEOUT_MS` (30000)
    /// - `CHAT_HISTORY_PAGE_SIZE` (50)
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidInput`] if `CHAT_WS_URL` is missing or the
    /// resulting connection or typing config fails validation.
    pub fn from_env() -> Result<Self, ChatError> {
        let url = std::env::var("CHAT_WS_URL").map_err(|_| ChatError::InvalidInput("CHAT_WS_URL required".into()))?;
        let connection = ConnectionConfig {
            url,
            reconnect_interval: Duration::from_millis(env_parse(
                "CHAT_RECONNECT_INTERVAL_MS",
                DEFAULT_RECONNECT_INTERVAL_MS,
            )),
            max_reconnect_attempts: env_parse("CHAT_MAX_RECONNECT_ATTEMPTS", DEFAULT_MAX_RECONNECT_ATTEMPTS),
            heartbeat_interval: Duration::from_millis(env_parse(
                "CHAT_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            timeout: Duration::from_millis(env_parse("CHAT_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)),
        };
        connection.validate()?;

        let config = Self {
            connection,
            typing: TypingConfig {
                ttl: Duration::from_millis(env_parse("CHAT_TYPING_TTL_MS", DEFAULT_TYPING_TTL_MS)),
                idle_timeout: Duration::from_millis(env_parse("CHAT_TYPING_IDLE_MS", DEFAULT_TYPING_IDLE_MS)),
                renew_interval: Duration::from_millis(env_parse("CHAT_TYPING_RENEW_MS", DEFAULT_TYPING_RENEW_MS)),
            },
            messaging: MessagingConfig {
                ack_timeout: Duration::from_millis(env_parse("CHAT_ACK_TIMEOUT_MS", DEFAULT_ACK_TIMEOUT_MS)),
                history_page_size: env_parse("CHAT_HISTORY_PAGE_SIZE", DEFAULT_HISTORY_PAGE_SIZE),
            },
        };
        config.typing.validate()?;
        Ok(config)
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
