//! Settlement configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then `SETTLEMENT__*` environment variables.

use crate::SettlementResult;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable prefix, e.g. `SETTLEMENT__DATABASE_URL`
pub const ENV_PREFIX: &str = "SETTLEMENT";

/// Configuration for the settlement engine and its adapters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// PostgreSQL connection string for the ledger store
    pub database_url: String,
    /// Pool size for the ledger store
    pub max_connections: u32,
    /// Attempts after the first on a store conflict
    pub max_conflict_retries: u32,
    /// Base delay between conflict retries, doubled per attempt
    pub retry_backoff_ms: u64,
    /// Send party notices at all
    pub notifications_enabled: bool,
    /// Fallback tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/settlement".to_string(),
            max_connections: 5,
            max_conflict_retries: 3,
            retry_backoff_ms: 25,
            notifications_enabled: true,
            log_filter: "info,settlement_engine=debug".to_string(),
        }
    }
}

impl SettlementConfig {
    /// Load defaults, then `path` if given (must exist), then the environment
    pub fn load(path: Option<&str>) -> SettlementResult<Self> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::with_name(path)),
            None => builder.add_source(config::File::with_name("settlement").required(false)),
        };

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
