//! Process configuration parsed from environment variables.
//!
//! Every knob has a default; a value that fails to parse falls back to that
//! default. Only the choice of backends can make loading fail.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_SESSION_PONG_WAIT_SECS: u64 = 60;
pub const DEFAULT_SESSION_WRITE_WAIT_SECS: u64 = 10;
pub const DEFAULT_SESSION_MAX_MESSAGE_BYTES: usize = 512 * 1024;
pub const DEFAULT_HUB_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL required for the postgres store backend")]
    MissingDatabaseUrl,
    #[error("invalid {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("IDENTITY_MODE=ticket needs the postgres store backend")]
    TicketsRequirePostgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMode {
    /// One-time websocket tickets stored in Postgres.
    Ticket,
    /// The credential is the user's UUID. Local development only.
    Dev,
}

/// Per-connection limits and liveness timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub ping_period: Duration,
    pub max_message_bytes: usize,
}

impl SessionConfig {
    /// Build from the read timeout; heartbeats go out at 90% of it.
    #[must_use]
    pub fn new(queue_capacity: usize, pong_wait: Duration, write_wait: Duration, max_message_bytes: usize) -> Self {
        Self { queue_capacity, pong_wait, write_wait, ping_period: pong_wait * 9 / 10, max_message_bytes }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_SESSION_QUEUE_CAPACITY,
            Duration::from_secs(DEFAULT_SESSION_PONG_WAIT_SECS),
            Duration::from_secs(DEFAULT_SESSION_WRITE_WAIT_SECS),
            DEFAULT_SESSION_MAX_MESSAGE_BYTES,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub identity_mode: IdentityMode,
    pub session: SessionConfig,
    pub hub_queue_capacity: usize,
    pub flush_interval: Duration,
}

impl Config {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `STORE_BACKEND`: `postgres` (default) or `memory`
    /// - `DATABASE_URL`: required when the backend is `postgres`
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `IDENTITY_MODE`: `ticket` (default) or `dev`
    /// - `SESSION_QUEUE_CAPACITY`: default 256
    /// - `SESSION_PONG_WAIT_SECS`: default 60
    /// - `SESSION_WRITE_WAIT_SECS`: default 10
    /// - `SESSION_MAX_MESSAGE_BYTES`: default 512 KiB
    /// - `HUB_QUEUE_CAPACITY`: default 256
    /// - `FLUSH_INTERVAL_MS`: default 5000
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an unknown backend/mode value, a
    /// missing `DATABASE_URL` with the postgres backend, or ticket identity
    /// without postgres.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_backend = parse_store_backend(std::env::var("STORE_BACKEND").ok().as_deref())?;
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let identity_mode = parse_identity_mode(std::env::var("IDENTITY_MODE").ok().as_deref())?;
        if identity_mode == IdentityMode::Ticket && store_backend != StoreBackend::Postgres {
            return Err(ConfigError::TicketsRequirePostgres);
        }

        let session = SessionConfig::new(
            env_parse("SESSION_QUEUE_CAPACITY", DEFAULT_SESSION_QUEUE_CAPACITY).max(1),
            Duration::from_secs(env_parse("SESSION_PONG_WAIT_SECS", DEFAULT_SESSION_PONG_WAIT_SECS)),
            Duration::from_secs(env_parse("SESSION_WRITE_WAIT_SECS", DEFAULT_SESSION_WRITE_WAIT_SECS)),
            env_parse("SESSION_MAX_MESSAGE_BYTES", DEFAULT_SESSION_MAX_MESSAGE_BYTES),
        );

        Ok(Self {
            port: env_parse("PORT", DEFAULT_PORT),
            store_backend,
            database_url,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            identity_mode,
            session,
            hub_queue_capacity: env_parse("HUB_QUEUE_CAPACITY", DEFAULT_HUB_QUEUE_CAPACITY).max(1),
            flush_interval: Duration::from_millis(env_parse("FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS).max(1)),
        })
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

fn parse_store_backend(raw: Option<&str>) -> Result<StoreBackend, ConfigError> {
    match raw.unwrap_or("postgres") {
        "postgres" => Ok(StoreBackend::Postgres),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(ConfigError::InvalidValue { key: "STORE_BACKEND", value: other.to_owned() }),
    }
}

fn parse_identity_mode(raw: Option<&str>) -> Result<IdentityMode, ConfigError> {
    match raw.unwrap_or("ticket") {
        "ticket" => Ok(IdentityMode::Ticket),
        "dev" => Ok(IdentityMode::Dev),
        other => Err(ConfigError::InvalidValue { key: "IDENTITY_MODE", value: other.to_owned() }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
