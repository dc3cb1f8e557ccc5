//! Node configuration.
//!
//! Loaded from a TOML file (every field has a default), then overridden by
//! `FARM_SYNC_*` environment variables, then by command-line flags in `main`.

use crate::dispatch::dispatcher::DispatchSettings;
use crate::executor::executor::ExecutorSettings;
use crate::health::types::{Destination, DestinationKind, DisabledPolicy};
use crate::policy::defaults::{WEBFARM_LOG, staging_log_name};
use crate::service::service::ServiceSettings;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Peers this node propagates to.
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity stamped on every task this node produces.
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Where the journals live. Unset keeps every log in memory.
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,

    #[serde(default = "default_dead_retention_secs")]
    pub dead_retention_secs: u64,

    #[serde(default = "default_compact_interval_secs")]
    pub compact_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            journal_dir: None,
            dead_retention_secs: default_dead_retention_secs(),
            compact_interval_secs: default_compact_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Per-request timeout of a single delivery.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub disabled_policy: DisabledPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            disabled_policy: DisabledPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive delivery failures before a destination counts as unreachable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Tasks older than this are skipped on receipt. Unset disables the check.
    #[serde(default)]
    pub max_task_age_secs: Option<u64>,

    /// Largest accepted task envelope.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            apply_timeout_ms: default_apply_timeout_ms(),
            max_task_age_secs: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    /// Object types whose changes are staged to staging targets.
    #[serde(default)]
    pub staged_object_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,

    #[serde(default)]
    pub display_name: Option<String>,

    pub kind: DestinationKind,

    pub url: String,

    /// Logs the destination subscribes to. Empty picks the default for its kind.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl DestinationConfig {
    pub fn to_destination(&self) -> Destination {
        Destination {
            name: self.name.clone(),
            display_name: self.display_name.clone().unwrap_or_else(|| self.name.clone()),
            kind: self.kind,
            url: self.url.clone(),
        }
    }

    pub fn subscribed_logs(&self) -> Vec<String> {
        if !self.logs.is_empty() {
            return self.logs.clone();
        }
        match self.kind {
            DestinationKind::FarmNode => vec![WEBFARM_LOG.to_string()],
            DestinationKind::StagingTarget => vec![staging_log_name(&self.name)],
        }
    }
}

fn default_node_name() -> String {
    "node-1".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:6000".to_string()
}
fn default_dead_retention_secs() -> u64 {
    7 * 24 * 3600
}
fn default_compact_interval_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    150
}
fn default_retry_max_ms() -> u64 {
    30_000
}
fn default_idle_poll_ms() -> u64 {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_probe_interval_secs() -> u64 {
    10
}
fn default_apply_timeout_ms() -> u64 {
    30_000
}
fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl SyncConfig {
    /// Reads `path` (if given), then applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let config = Self::read_toml_file(path)?;
                tracing::info!("Loaded configuration from {}", path.display());
                config
            }
            None => {
                tracing::info!("No configuration file given, using defaults");
                Self::default()
            }
        };

        let config = config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn read_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Applies `FARM_SYNC_*` overrides looked up through `lookup`.
    pub fn apply_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("FARM_SYNC_NODE_NAME") {
            self.node.name = name;
        }
        if let Some(bind) = lookup("FARM_SYNC_BIND") {
            self.node.bind = bind;
        }
        if let Some(dir) = lookup("FARM_SYNC_JOURNAL_DIR") {
            self.log.journal_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("FARM_SYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::ValidationError("node.name must not be empty".into()));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health.probe_interval_secs == 0 || self.log.compact_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "probe and compaction intervals must be positive".into(),
            ));
        }
        if self.dispatch.idle_poll_ms == 0
            || self.dispatch.request_timeout_ms == 0
            || self.executor.apply_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "dispatch and executor timeouts must be positive".into(),
            ));
        }
        if self.dispatch.retry_base_ms > self.dispatch.retry_max_ms {
            return Err(ConfigError::ValidationError(
                "dispatch.retry_base_ms exceeds dispatch.retry_max_ms".into(),
            ));
        }

        let mut seen = HashSet::new();
        for destination in &self.destinations {
            if destination.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("destination with empty name".into()));
            }
            if destination.name == self.node.name {
                return Err(ConfigError::ValidationError(format!(
                    "destination '{}' is this node",
                    destination.name
                )));
            }
            if !seen.insert(destination.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate destination '{}'",
                    destination.name
                )));
            }
        }
        Ok(())
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.logging.level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            "info" => tracing::Level::INFO,
            other => {
                tracing::warn!("Unknown log level '{}', using info", other);
                tracing::Level::INFO
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.request_timeout_ms)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_retries: self.dispatch.max_retries,
            retry_base: Duration::from_millis(self.dispatch.retry_base_ms),
            retry_max: Duration::from_millis(self.dispatch.retry_max_ms),
            idle_poll: Duration::from_millis(self.dispatch.idle_poll_ms),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            dispatch: self.dispatch_settings(),
            probe_interval: Duration::from_secs(self.health.probe_interval_secs),
            compact_interval: Duration::from_secs(self.log.compact_interval_secs),
            dead_retention: Duration::from_secs(self.log.dead_retention_secs),
            journal_dir: self.log.journal_dir.clone(),
        }
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            apply_timeout: Duration::from_millis(self.executor.apply_timeout_ms),
            max_task_age: self.executor.max_task_age_secs.map(Duration::from_secs),
        }
    }

    /// Names of the configured staging targets.
    pub fn staging_servers(&self) -> Vec<String> {
        self.destinations
            .iter()
            .filter(|d| d.kind == DestinationKind::StagingTarget)
            .map(|d| d.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[node]
name = "web1"
bind = "0.0.0.0:7000"

[log]
journal_dir = "/var/lib/farm-sync"
dead_retention_secs = 86400

[dispatch]
max_retries = 8
disabled_policy = "drop"

[health]
failure_threshold = 4

[executor]
max_task_age_secs = 3600

[policy]
staged_object_types = ["article", "page"]

[[destinations]]
name = "web2"
kind = "farm_node"
url = "http://10.0.0.2:7000"

[[destinations]]
name = "staging"
display_name = "Staging server"
kind = "staging_target"
url = "http://staging:7000"
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();

        assert_eq!(config.node.bind, "127.0.0.1:6000");
        assert_eq!(config.dispatch.max_retries, 5);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.dispatch.disabled_policy, DisabledPolicy::Retain);
        assert!(config.log.journal_dir.is_none());
        assert!(config.destinations.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let config = SyncConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.node.name, "web1");
        assert_eq!(config.dispatch.max_retries, 8);
        assert_eq!(config.dispatch.retry_base_ms, 150);
        assert_eq!(config.dispatch.disabled_policy, DisabledPolicy::Drop);
        assert_eq!(config.health.failure_threshold, 4);
        assert_eq!(config.policy.staged_object_types, vec!["article", "page"]);
        assert_eq!(config.staging_servers(), vec!["staging"]);

        let staging = config.destinations[1].to_destination();
        assert_eq!(staging.display_name, "Staging server");
        assert_eq!(staging.kind, DestinationKind::StagingTarget);
        assert_eq!(config.destinations[0].to_destination().display_name, "web2");
        assert_eq!(config.destinations[0].subscribed_logs(), vec!["webfarm"]);
        assert_eq!(config.destinations[1].subscribed_logs(), vec!["staging:staging"]);

        let executor = config.executor_settings();
        assert_eq!(executor.max_task_age, Some(Duration::from_secs(3600)));
        let service = config.service_settings();
        assert_eq!(service.dead_retention, Duration::from_secs(86400));
        assert_eq!(service.journal_dir, Some(PathBuf::from("/var/lib/farm-sync")));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FARM_SYNC_NODE_NAME", "web9"),
            ("FARM_SYNC_JOURNAL_DIR", "/tmp/journals"),
            ("FARM_SYNC_LOG_LEVEL", "debug"),
        ]);

        let config = SyncConfig::from_toml_str(SAMPLE)
            .unwrap()
            .apply_env_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.node.name, "web9");
        assert_eq!(config.node.bind, "0.0.0.0:7000");
        assert_eq!(config.log.journal_dir, Some(PathBuf::from("/tmp/journals")));
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SyncConfig::from_toml_str(SAMPLE).unwrap();
        config.health.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = SyncConfig::from_toml_str(SAMPLE).unwrap();
        config.destinations.push(config.destinations[0].clone());
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_toml_str(SAMPLE).unwrap();
        config.node.name = "  ".into();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::from_toml_str(SAMPLE).unwrap();
        config.node.name = "web2".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = SyncConfig::from_toml_str("[node\nname = 1").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("farm-sync.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.destinations.len(), 2);

        let missing = SyncConfig::load(Some(&dir.path().join("missing.toml")));
        assert!(matches!(missing, Err(ConfigError::ReadError(_))));
    }
}
