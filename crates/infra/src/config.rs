//! Store and outbox configuration, read from the environment.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} is required when USE_PERSISTENT_STORES=true")]
    Missing { name: &'static str },

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Which store backend to run against, plus outbox relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Postgres when true, in-memory otherwise.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            max_connections: 5,
            outbox_batch_size: 100,
            outbox_poll_interval: Duration::from_millis(1000),
        }
    }
}

impl StoreConfig {
    /// Read configuration from process environment variables.
    ///
    /// - `USE_PERSISTENT_STORES`: `true`/`false` (default `false`)
    /// - `DATABASE_URL`: required when persistent
    /// - `BIZHUB_DB_MAX_CONNECTIONS`: pool size (default 5)
    /// - `BIZHUB_OUTBOX_BATCH_SIZE`: records per relay batch (default 100)
    /// - `BIZHUB_OUTBOX_POLL_INTERVAL_MS`: relay poll interval (default 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let use_persistent_stores = match lookup("USE_PERSISTENT_STORES") {
            None => defaults.use_persistent_stores,
            Some(raw) => parse_bool("USE_PERSISTENT_STORES", &raw)?,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing { name: "DATABASE_URL" });
        }

        let max_connections = parse_positive(&lookup, "BIZHUB_DB_MAX_CONNECTIONS")?
            .map(|n| n as u32)
            .unwrap_or(defaults.max_connections);
        let outbox_batch_size = parse_positive(&lookup, "BIZHUB_OUTBOX_BATCH_SIZE")?
            .map(|n| n as usize)
            .unwrap_or(defaults.outbox_batch_size);
        let outbox_poll_interval = parse_positive(&lookup, "BIZHUB_OUTBOX_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.outbox_poll_interval);

        Ok(Self {
            use_persistent_stores,
            database_url,
            max_connections,
            outbox_batch_size,
            outbox_poll_interval,
        })
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw.to_string(),
            reason: "expected true or false",
        }),
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 && n <= u32::MAX as u64 => Ok(Some(n)),
        _ => Err(ConfigError::Invalid {
            name,
            value: raw,
            reason: "expected a positive integer",
        }),
    }
}
