//! Node configuration.
//!
//! The configuration is loaded once at startup into an explicit, versioned
//! [`NodeConfig`] struct and handed to the coordinator. Nothing re-reads
//! settings from disk per request; runtime changes go through the same
//! single-writer discipline as the store.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Version of the configuration schema.
pub const CONFIG_VERSION: u32 = 1;

/// Default interval between manifest reconciliation passes.
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Node configuration, loaded at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Configuration schema version.
    pub version: u32,
    /// Root directory holding the per-video media trees (`videos/{id}/...`).
    pub data_dir: PathBuf,
    /// SQLite database URL (e.g. "sqlite:tubenode.db?mode=rwc").
    pub database_url: String,
    /// API bind address.
    pub bind_address: String,
    /// API port.
    pub port: u16,
    /// Number of worker tasks. Defaults to available parallelism.
    pub workers: usize,
    /// Shared JWT signing secret, distributed to workers over the bus.
    pub jwt_secret: String,
    /// Whether live streams are recorded to disk. When disabled the
    /// reconciler skips the dangling-manifest pass.
    pub record_streams: bool,
    /// Interval between manifest reconciliation passes.
    pub reconcile_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            data_dir: PathBuf::from("videos"),
            database_url: "sqlite:tubenode.db?mode=rwc".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 14569,
            workers: default_worker_count(),
            jwt_secret: String::new(),
            record_streams: true,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
        }
    }
}

/// One worker per CPU core.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `DATA_DIR` - media tree root
    /// - `DATABASE_URL` - SQLite URL
    /// - `API_BIND_ADDRESS` / `API_PORT`
    /// - `WORKER_COUNT`
    /// - `JWT_SECRET`
    /// - `RECORD_STREAMS` ("true"/"false")
    /// - `RECONCILE_INTERVAL_SECS`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("DATA_DIR")
            && !dir.trim().is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("DATABASE_URL")
            && !url.trim().is_empty()
        {
            config.database_url = url;
        }

        if let Ok(bind_address) = std::env::var("API_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            config.bind_address = bind_address;
        }

        if let Ok(port) = std::env::var("API_PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            config.port = parsed;
        }

        if let Ok(workers) = std::env::var("WORKER_COUNT")
            && let Ok(parsed) = workers.parse::<usize>()
            && parsed > 0
        {
            config.workers = parsed;
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.jwt_secret = secret;
        }

        if let Ok(record) = std::env::var("RECORD_STREAMS")
            && let Ok(parsed) = record.parse::<bool>()
        {
            config.record_streams = parsed;
        }

        if let Ok(secs) = std::env::var("RECONCILE_INTERVAL_SECS")
            && let Ok(parsed) = secs.parse::<u64>()
            && parsed > 0
        {
            config.reconcile_interval = Duration::from_secs(parsed);
        }

        config
    }

    /// Validate the configuration before handing it to the coordinator.
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.trim().is_empty() {
            return Err(crate::Error::config("JWT_SECRET must be set"));
        }
        if self.workers == 0 {
            return Err(crate::Error::config("worker count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert!(config.record_streams);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_validate_requires_secret() {
        let config = NodeConfig::default();
        assert!(config.validate().is_err());

        let config = NodeConfig {
            jwt_secret: "secret".to_string(),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
