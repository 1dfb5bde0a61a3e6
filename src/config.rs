use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "CONFIG_READ",
            ConfigError::Parse(_) => "CONFIG_PARSE",
        }
    }
}

/// Log file rotation policy
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: LogRotation,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "transfer_outbox.log".to_string(),
            use_json: false,
            rotation: LogRotation::Daily,
            broker: BrokerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            consumer: ConsumerConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Topic, groups and redelivery limits
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub topic: String,
    /// Subscription filter, `*` for every tag
    pub tag: String,
    pub producer_group: String,
    pub consumer_group: String,
    /// Redeliveries before a message goes to the dead-letter queue
    pub max_reconsume_times: u32,
    /// Messages handed to the listener per callback
    pub batch_size: usize,
    /// Check-back attempts before an UNKNOWN half is discarded
    pub max_check_times: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: "TransactionMessage".to_string(),
            tag: "*".to_string(),
            producer_group: "transaction_producer_group".to_string(),
            consumer_group: "transaction_consumer_group".to_string(),
            max_reconsume_times: 16,
            batch_size: 32,
            max_check_times: 15,
        }
    }
}

/// Key-ordered dispatcher pool
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Lanes running at the same time
    pub parallelism: usize,
    /// Prefix for log lines of this dispatcher
    pub name: String,
    pub drain_timeout_ms: u64,
    pub reclaim_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallelism: 32,
            name: "transfer-dispatcher".to_string(),
            drain_timeout_ms: 5_000,
            reclaim_interval_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

/// Which listener strategy consumes deliveries
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerMode {
    /// Batch handled in delivery order on the delivering task
    Concurrent,
    /// Fan out by correlation key over the dispatcher
    #[default]
    KeyOrdered,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerConfig {
    pub mode: ListenerMode,
    /// User property holding the correlation key
    pub key_property: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            mode: ListenerMode::KeyOrdered,
            key_property: "orderId".to_string(),
        }
    }
}

/// Producer-side check-back
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub check_interval_ms: u64,
    pub check_batch_size: usize,
    /// Age after which an uncommitted half is treated as rolled back
    pub rollback_unresolved_after_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            check_batch_size: 100,
            rollback_unresolved_after_ms: 30_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn rollback_unresolved_after(&self) -> Duration {
        Duration::from_millis(self.rollback_unresolved_after_ms)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(format!("config/{}.yaml", env))
    }
}
