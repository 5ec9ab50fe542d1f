use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};

/// Upper bound for every configured timeout (one day)
const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Ingestion connections, each served by its own thread
    #[serde(default = "default_connections")]
    pub connections: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_upsert_timeout")]
    pub upsert_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Budget for reading every record in `GET /v1/scans`
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/scan-ledger/scans.db")
}

fn default_connections() -> usize {
    4
}

fn default_upsert_timeout() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

fn default_monitor_interval() -> u64 {
    1_000
}

fn default_snapshot_timeout() -> u64 {
    5_000
}

fn default_listen() -> String {
    "[::]:8080".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            connections: default_connections(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upsert_timeout_ms: default_upsert_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_monitor_interval(),
            snapshot_timeout_ms: default_snapshot_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            snapshot_timeout_ms: default_snapshot_timeout(),
        }
    }
}

impl IngestConfig {
    pub fn upsert_timeout(&self) -> Duration {
        Duration::from_millis(self.upsert_timeout_ms)
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

impl ApiConfig {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.store.connections == 0 {
            bail!("store.connections must be at least 1");
        }
        // Every connection would get its own private database
        if self.store.db_path.as_os_str() == ":memory:" {
            bail!("store.db_path must be a file, not :memory:");
        }
        if self.monitor.interval_ms == 0 {
            bail!("monitor.interval_ms must be greater than 0");
        }
        let timeouts = [
            ("ingest.upsert_timeout_ms", self.ingest.upsert_timeout_ms),
            ("monitor.snapshot_timeout_ms", self.monitor.snapshot_timeout_ms),
            ("api.snapshot_timeout_ms", self.api.snapshot_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 || value > MAX_TIMEOUT_MS {
                bail!("{} must be between 1 and {}", name, MAX_TIMEOUT_MS);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.store.connections, 4);
        assert_eq!(config.ingest.upsert_timeout(), Duration::from_secs(10));
        assert!(config.monitor.enabled);
        assert_eq!(config.monitor.interval(), Duration::from_secs(1));
        assert_eq!(config.api.listen, "[::]:8080");
        assert_eq!(config.api.snapshot_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [store]
            db_path = "/tmp/scans.db"

            [monitor]
            interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/scans.db"));
        assert_eq!(config.store.connections, 4);
        assert_eq!(config.monitor.interval(), Duration::from_millis(250));
        assert_eq!(config.monitor.snapshot_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = Config::default();
        config.store.connections = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.db_path = PathBuf::from(":memory:");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitor.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api.snapshot_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_timeouts() {
        let config: Config = toml::from_str(
            r#"
            [ingest]
            upsert_timeout_ms = 3000000000
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ingest.upsert_timeout_ms"));

        let mut config = Config::default();
        config.monitor.snapshot_timeout_ms = MAX_TIMEOUT_MS + 1;
        assert!(config.validate().is_err());

        config.monitor.snapshot_timeout_ms = MAX_TIMEOUT_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_and_monitor_timeouts_are_independent() {
        let config: Config = toml::from_str(
            r#"
            [monitor]
            snapshot_timeout_ms = 500

            [api]
            snapshot_timeout_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(config.monitor.snapshot_timeout(), Duration::from_millis(500));
        assert_eq!(config.api.snapshot_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_reports_path() {
        let err = Config::load("/nonexistent/scan-ledgerd.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/scan-ledgerd.toml"));
    }
}
