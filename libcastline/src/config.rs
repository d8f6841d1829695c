//! Configuration management for Castline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    Http,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub kind: PublisherKind,
    pub api_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    /// HTTP client timeout in seconds
    pub request_timeout: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            kind: PublisherKind::Http,
            api_url: "https://api.neynar.com".to_string(),
            api_key_env: "CASTLINE_API_KEY".to_string(),
            request_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps in the daemon
    pub poll_interval: u64,
    /// Seconds allowed for one publisher call
    pub publish_timeout: u64,
    /// Lanes processed at once
    pub concurrency: usize,
    /// Maximum due casts per sweep; 0 means unbounded
    pub batch_limit: usize,
    /// Seconds an account lookup is cached; 0 disables the cache
    pub account_cache_ttl: u64,
    /// Seconds after which a `publishing` row counts as interrupted
    pub stale_publishing_after: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            publish_timeout: 30,
            concurrency: 4,
            batch_limit: 0,
            account_cache_ttl: 30,
            stale_publishing_after: 900,
        }
    }
}

impl SweepConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout)
    }

    pub fn batch_limit(&self) -> Option<usize> {
        (self.batch_limit > 0).then_some(self.batch_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per sweep for transient publisher errors (1 = no retry)
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Move failed casts back to scheduled on later sweeps
    pub auto_requeue: bool,
    /// Failed casts with at least this many failures stay failed
    pub max_requeues: i64,
    /// Seconds
    pub requeue_base_delay: u64,
    /// Seconds
    pub requeue_max_delay: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            auto_requeue: false,
            max_requeues: 3,
            requeue_base_delay: 300,
            requeue_max_delay: 3600,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// `CASTLINE_DB_PATH` overrides the database path from the file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let mut config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;

        if let Ok(db_path) = std::env::var("CASTLINE_DB_PATH") {
            config.database.path = db_path;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults if no file exists
    pub fn load_or_default() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if config_path.exists() {
            return Self::load_from_path(&config_path);
        }

        let mut config = Self::default_config();
        if let Ok(db_path) = std::env::var("CASTLINE_DB_PATH") {
            config.database.path = db_path;
        }
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/castline/casts.db".to_string(),
            },
            publisher: PublisherConfig::default(),
            sweep: SweepConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.sweep.concurrency == 0 {
            return Err(invalid("sweep.concurrency", "must be at least 1"));
        }
        if self.sweep.publish_timeout == 0 {
            return Err(invalid("sweep.publish_timeout", "must be at least 1 second"));
        }
        if self.sweep.poll_interval == 0 {
            return Err(invalid("sweep.poll_interval", "must be at least 1 second"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms", "must not be below retry.base_delay_ms"));
        }
        if self.retry.requeue_max_delay < self.retry.requeue_base_delay {
            return Err(invalid(
                "retry.requeue_max_delay",
                "must not be below retry.requeue_base_delay",
            ));
        }
        if self.retry.max_requeues < 0 {
            return Err(invalid("retry.max_requeues", "must not be negative"));
        }

        let longest = self.longest_publish_secs();
        if self.sweep.stale_publishing_after <= longest {
            return Err(invalid(
                "sweep.stale_publishing_after",
                &format!(
                    "must exceed the longest publish attempt ({}s with timeouts and retries)",
                    longest
                ),
            ));
        }
        Ok(())
    }

    /// Upper bound on how long one cast can stay claimed by a live sweep:
    /// every attempt timing out plus the largest jittered delay between
    /// attempts.
    pub fn longest_publish_secs(&self) -> u64 {
        let attempts = u64::from(self.retry.max_attempts.max(1));
        let calls = self.sweep.publish_timeout.saturating_mul(attempts);
        // Jitter adds up to a quarter of each delay
        let waits_ms = (attempts - 1)
            .saturating_mul(self.retry.max_delay_ms)
            .saturating_mul(5)
            / 4;
        calls.saturating_add(waits_ms.div_ceil(1000))
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::CastlineError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CASTLINE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("castline").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        std::env::remove_var("CASTLINE_DB_PATH");
        let file = write_config("[database]\npath = \"/tmp/casts.db\"\n");

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.database.path, "/tmp/casts.db");
        assert_eq!(config.publisher.kind, PublisherKind::Http);
        assert_eq!(config.sweep.poll_interval, 60);
        assert_eq!(config.sweep.concurrency, 4);
        assert_eq!(config.sweep.batch_limit(), None);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.retry.auto_requeue);
    }

    #[test]
    #[serial]
    fn test_full_config_parses() {
        std::env::remove_var("CASTLINE_DB_PATH");
        let file = write_config(
            r#"
[database]
path = "/tmp/casts.db"

[publisher]
kind = "mock"
api_url = "http://localhost:8080"

[sweep]
publish_timeout = 5
batch_limit = 50

[retry]
max_attempts = 1
auto_requeue = true
max_requeues = 5
"#,
        );

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.publisher.kind, PublisherKind::Mock);
        assert_eq!(config.publisher.api_url, "http://localhost:8080");
        assert_eq!(config.publisher.api_key_env, "CASTLINE_API_KEY");
        assert_eq!(config.sweep.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.sweep.batch_limit(), Some(50));
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.retry.auto_requeue);
        assert_eq!(config.retry.max_requeues, 5);
    }

    #[test]
    #[serial]
    fn test_db_path_env_override() {
        let file = write_config("[database]\npath = \"/tmp/casts.db\"\n");
        std::env::set_var("CASTLINE_DB_PATH", "/tmp/override.db");

        let config = Config::load_from_path(file.path()).unwrap();
        std::env::remove_var("CASTLINE_DB_PATH");

        assert_eq!(config.database.path, "/tmp/override.db");
    }

    #[test]
    #[serial]
    fn test_missing_database_section_is_parse_error() {
        std::env::remove_var("CASTLINE_DB_PATH");
        let file = write_config("[sweep]\nconcurrency = 2\n");

        let err = Config::load_from_path(file.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(
            err,
            crate::error::CastlineError::Config(ConfigError::ParseError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        std::env::remove_var("CASTLINE_DB_PATH");
        let file = write_config("[database]\npath = \"/tmp/casts.db\"\n[sweep]\nconcurrency = 0\n");

        match Config::load_from_path(file.path()) {
            Err(crate::error::CastlineError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "sweep.concurrency");
            }
            other => panic!("Expected invalid value error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[serial]
    fn test_stale_threshold_must_outlast_publish_attempts() {
        std::env::remove_var("CASTLINE_DB_PATH");
        let file = write_config(
            "[database]\npath = \"/tmp/casts.db\"\n[sweep]\npublish_timeout = 30\nstale_publishing_after = 100\n",
        );

        // 3 attempts x 30s plus two jittered 8s waits = 110s
        match Config::load_from_path(file.path()) {
            Err(crate::error::CastlineError::Config(ConfigError::InvalidValue { field, reason })) => {
                assert_eq!(field, "sweep.stale_publishing_after");
                assert!(reason.contains("110s"), "unexpected reason: {}", reason);
            }
            other => panic!("Expected invalid value error, got {:?}", other.map(|_| ())),
        }

        assert_eq!(Config::default_config().longest_publish_secs(), 110);
    }

    #[test]
    #[serial]
    fn test_unknown_publisher_kind_rejected() {
        std::env::remove_var("CASTLINE_DB_PATH");
        let file = write_config("[database]\npath = \"/tmp/casts.db\"\n[publisher]\nkind = \"carrier-pigeon\"\n");
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    #[serial]
    fn test_missing_file_is_read_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/castline.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::CastlineError::Config(ConfigError::ReadError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_env_override() {
        std::env::set_var("CASTLINE_CONFIG", "/tmp/custom.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("CASTLINE_CONFIG");

        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    #[serial]
    fn test_load_or_default_without_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("CASTLINE_CONFIG", dir.path().join("absent.toml"));
        std::env::remove_var("CASTLINE_DB_PATH");

        let config = Config::load_or_default().unwrap();
        std::env::remove_var("CASTLINE_CONFIG");

        assert_eq!(config.database.path, "~/.local/share/castline/casts.db");
    }
}
