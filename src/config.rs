//! Configuration module
//!
//! Loads runtime configuration from environment variables.

use std::env;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Node identifier stamped into every HLC timestamp this process issues
    pub node_id: u16,

    /// Actor mailbox capacity
    pub mailbox: usize,

    /// Automatic snapshot interval, in events; None disables
    pub snapshot_every: Option<u64>,

    /// Connection URL for the durable store, when one is used
    pub database_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = env::var("EVENTFOLD_NODE_ID")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EVENTFOLD_NODE_ID"))?;

        let mailbox = env::var("EVENTFOLD_MAILBOX")
            .unwrap_or_else(|_| "64".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EVENTFOLD_MAILBOX"))?;

        let snapshot_every = match env::var("EVENTFOLD_SNAPSHOT_EVERY") {
            Ok(value) => Some(
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("EVENTFOLD_SNAPSHOT_EVERY"))?,
            ),
            Err(_) => None,
        };

        let database_url = env::var("DATABASE_URL").ok();

        Ok(Self {
            node_id,
            mailbox,
            snapshot_every,
            database_url,
        })
    }

    /// The database URL, required when building the Postgres store
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingEnv("DATABASE_URL"))
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
