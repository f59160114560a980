//! labgrid.toml configuration parser.
//!
//! Every section is optional; anything missing falls back to the
//! defaults below so a bare `labd serve` works against a local Redis.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides `redis.url`.
pub const REDIS_URL_ENV: &str = "LABGRID_REDIS_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub server: ServerConfig,
    pub redis: RedisSection,
    pub queue: QueueConfig,
    pub heartbeat: HeartbeatConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8090".to_string(),
            data_dir: PathBuf::from("/var/lib/labgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
    /// Optional prefix applied to every key (e.g. `lg:prod:`).
    pub namespace: Option<String>,
    pub max_connections: usize,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            namespace: None,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Shared cross-replica job queue.
    pub job_queue: String,
    /// Messages inspected per affinity pop before giving up.
    pub retry_count: u32,
    /// Age after which a message is handed back to the caller to be failed.
    pub expire_timeout_secs: u64,
    pub owned_set_ttl_secs: u64,
    pub blocking_timeout_secs: u64,
    pub idle_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Number of affinity dispatcher loops per replica.
    pub dispatchers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_queue: "labgrid_job_queue".to_string(),
            retry_count: 10,
            expire_timeout_secs: 600,
            owned_set_ttl_secs: 60,
            blocking_timeout_secs: 1,
            idle_backoff_ms: 250,
            max_backoff_ms: 5_000,
            dispatchers: 2,
        }
    }
}

impl QueueConfig {
    pub fn expire_timeout(&self) -> Duration {
        Duration::from_secs(self.expire_timeout_secs)
    }

    pub fn owned_set_ttl(&self) -> Duration {
        Duration::from_secs(self.owned_set_ttl_secs)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.blocking_timeout_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub ttl_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            ttl_secs: 15,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent engine runs per replica.
    pub task_pool_size: usize,
    /// Concurrent nodes per DAG wave.
    pub wave_pool_size: usize,
    pub node_poll_interval_ms: u64,
    pub node_poll_retries: u32,
    /// Hard-fail the run when a node never reaches a terminal status.
    pub fail_on_node_timeout: bool,
    pub action_poll_interval_ms: u64,
    pub action_query_timeout_secs: u64,
    pub action_callback_timeout_secs: u64,
    pub action_result_ttl_secs: u64,
    pub action_request_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_pool_size: 64,
            wave_pool_size: 8,
            node_poll_interval_ms: 1_000,
            node_poll_retries: 3_600,
            fail_on_node_timeout: false,
            action_poll_interval_ms: 200,
            action_query_timeout_secs: 10,
            action_callback_timeout_secs: 600,
            action_result_ttl_secs: 3_600,
            action_request_ttl_secs: 3_600,
        }
    }
}

impl EngineConfig {
    pub fn node_poll_interval(&self) -> Duration {
        Duration::from_millis(self.node_poll_interval_ms)
    }

    pub fn action_poll_interval(&self) -> Duration {
        Duration::from_millis(self.action_poll_interval_ms)
    }

    pub fn action_query_timeout(&self) -> Duration {
        Duration::from_secs(self.action_query_timeout_secs)
    }

    pub fn action_callback_timeout(&self) -> Duration {
        Duration::from_secs(self.action_callback_timeout_secs)
    }

    pub fn action_result_ttl(&self) -> Duration {
        Duration::from_secs(self.action_result_ttl_secs)
    }

    pub fn action_request_ttl(&self) -> Duration {
        Duration::from_secs(self.action_request_ttl_secs)
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SchedulerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            config.redis.url = url;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_secs must be positive".into(),
            ));
        }
        // A refresh period equal to the TTL would let the key lapse between refreshes.
        if self.heartbeat.interval_secs >= self.heartbeat.ttl_secs {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.interval_secs ({}) must be shorter than heartbeat.ttl_secs ({})",
                self.heartbeat.interval_secs, self.heartbeat.ttl_secs
            )));
        }
        if self.queue.retry_count == 0 {
            return Err(ConfigError::Invalid("queue.retry_count must be positive".into()));
        }
        if self.queue.job_queue.is_empty() {
            return Err(ConfigError::Invalid("queue.job_queue must not be empty".into()));
        }
        if self.engine.task_pool_size == 0 || self.engine.wave_pool_size == 0 {
            return Err(ConfigError::Invalid("engine pool sizes must be positive".into()));
        }
        if self.redis.max_connections == 0 {
            return Err(ConfigError::Invalid("redis.max_connections must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.heartbeat.interval() < config.heartbeat.ttl());
    }

    #[test]
    fn parse_partial_file() {
        let toml_str = r#"
[redis]
url = "redis://cache:6379/2"

[heartbeat]
interval_secs = 2
ttl_secs = 6

[engine]
fail_on_node_timeout = true
"#;
        let config: SchedulerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.redis.url, "redis://cache:6379/2");
        assert_eq!(config.redis.max_connections, 8);
        assert_eq!(config.heartbeat.ttl(), Duration::from_secs(6));
        assert!(config.engine.fail_on_node_timeout);
        assert_eq!(config.queue.job_queue, "labgrid_job_queue");
    }

    #[test]
    fn heartbeat_interval_must_be_shorter_than_ttl() {
        let mut config = SchedulerConfig::default();
        config.heartbeat.interval_secs = 15;
        config.heartbeat.ttl_secs = 15;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn render_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labgrid.toml");
        let mut config = SchedulerConfig::default();
        config.queue.dispatchers = 4;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = SchedulerConfig::from_file(Path::new("/nonexistent/labgrid.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
