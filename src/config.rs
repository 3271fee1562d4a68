use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL. Without one the service runs on the in-memory store.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_postgres_max_connections")]
    pub postgres_max_connections: u32,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "points-ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            postgres_url: None,
            postgres_max_connections: default_postgres_max_connections(),
            engine: EngineConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

fn default_postgres_max_connections() -> u32 {
    20
}

/// Transfer engine tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest accepted idempotency key, in bytes
    pub max_key_len: usize,
    /// Longest accepted transfer note, in bytes
    pub max_note_len: usize,
    /// How often a duplicate submission re-reads the winner's row
    pub settle_poll_interval_ms: u64,
    /// How long a duplicate submission waits for the winner to settle
    pub settle_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_key_len: 128,
            max_note_len: 1024,
            settle_poll_interval_ms: 50,
            settle_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn settle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settle_poll_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Recovery worker schedule
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub scan_interval_secs: u64,
    /// A pending/processing transfer untouched for this long is considered stranded
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> anyhow::Result<Self> {
        Self::load_from(format!("config/{}.yaml", env))
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config yaml: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_level: debug\nlog_dir: /tmp\nlog_file: pl.log\nuse_json: true\nrotation: never\nengine:\n  max_key_len: 64"
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.use_json);
        assert!(config.postgres_url.is_none());
        assert_eq!(config.postgres_max_connections, 20);
        assert_eq!(config.engine.max_key_len, 64);
        assert_eq!(config.engine.max_note_len, 1024);
        assert_eq!(config.recovery, RecoveryConfig::default());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = AppConfig::load_from("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_engine_durations() {
        let engine = EngineConfig::default();
        assert_eq!(engine.settle_poll_interval(), Duration::from_millis(50));
        assert_eq!(engine.settle_timeout(), Duration::from_secs(5));
    }
}
