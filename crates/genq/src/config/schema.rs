use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::content::DEFAULT_PUBLISH_STATUS;
use crate::db::default_database_path;
use crate::logging::{LogFormat, DEFAULT_FILTER};
use crate::provider::{CommandBackend, CommandSettings, FallbackTable, ProviderRegistry};
use crate::queue::dispatcher::{ExecutionMode, DispatcherConfig};
use crate::queue::executor::ExecutorConfig;
use crate::queue::retry::RetryPolicy;
use crate::secrets::expand_home;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.genq/data/genq.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Used when a payload names no provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, CommandSettings>,
    /// Overrides for the built-in fallback table, per provider.
    #[serde(default)]
    pub fallbacks: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            database_path: None,
            queue: QueueConfig::default(),
            default_provider: None,
            providers: BTreeMap::new(),
            fallbacks: BTreeMap::new(),
            content: ContentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub fail_fast_on_rejected: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    24 * 60 * 60
}

fn default_stagger_secs() -> u64 {
    10
}

fn default_batch_size() -> u32 {
    5
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            stagger_secs: default_stagger_secs(),
            batch_size: default_batch_size(),
            lease_ttl_secs: default_lease_ttl_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            execution_mode: ExecutionMode::default(),
            max_concurrency: default_max_concurrency(),
            fail_fast_on_rejected: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Defaults to `~/.genq/content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<String>,
    #[serde(default = "default_publish_status")]
    pub publish_status: String,
}

fn default_publish_status() -> String {
    DEFAULT_PUBLISH_STATUS.to_string()
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            output_directory: None,
            publish_status: default_publish_status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_filter() -> String {
    DEFAULT_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(expand_home(path))),
            None => default_database_path(),
        }
    }

    pub fn output_directory(&self) -> Option<PathBuf> {
        match &self.content.output_directory {
            Some(path) => Some(PathBuf::from(expand_home(path))),
            None => dirs::home_dir().map(|h| h.join(".genq").join("content")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.queue.max_attempts,
            Duration::from_secs(self.queue.backoff_base_secs),
        )
        .with_max_delay(Duration::from_secs(self.queue.max_backoff_secs))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.queue.batch_size,
            lease_ttl: Duration::from_secs(self.queue.lease_ttl_secs),
            execution_mode: self.queue.execution_mode,
            max_concurrency: self.queue.max_concurrency,
            retry: self.retry_policy(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            call_timeout: Duration::from_secs(self.queue.call_timeout_secs),
            stagger: Duration::from_secs(self.queue.stagger_secs),
            fail_fast_on_rejected: self.queue.fail_fast_on_rejected,
            default_publish_status: self.content.publish_status.clone(),
        }
    }

    /// The built-in table with this config's overrides applied.
    pub fn fallback_table(&self) -> FallbackTable {
        let mut table = FallbackTable::default();
        for (provider, list) in &self.fallbacks {
            table.set(provider.clone(), list.clone());
        }
        table
    }

    /// One command backend per configured provider.
    pub fn build_registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new().with_fallbacks(self.fallback_table());
        if let Some(default) = &self.default_provider {
            registry = registry.with_default_provider(default.clone());
        }
        for (id, settings) in &self.providers {
            registry.register(std::sync::Arc::new(CommandBackend::new(
                id.clone(),
                settings.clone(),
            )));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.batch_size, 5);
        assert_eq!(dispatcher.lease_ttl, Duration::from_secs(300));
        assert_eq!(dispatcher.retry.max_attempts, 3);
        assert_eq!(dispatcher.retry.base_delay, Duration::from_secs(60));

        let executor = config.executor_config();
        assert_eq!(executor.call_timeout, Duration::from_secs(60));
        assert_eq!(executor.stagger, Duration::from_secs(10));
        assert_eq!(executor.default_publish_status, "draft");
        assert!(!executor.fail_fast_on_rejected);
    }

    #[test]
    fn test_fallback_overrides_replace_entry() {
        let mut config = Config::default();
        config
            .fallbacks
            .insert("openai".to_string(), vec!["local".to_string()]);
        let table = config.fallback_table();
        assert_eq!(table.candidates("openai"), vec!["local".to_string()]);
        assert_eq!(table.candidates("gemini")[0], "openai");
    }

    #[test]
    fn test_build_registry_registers_command_providers() {
        let mut config = Config::default();
        config
            .providers
            .insert("local".to_string(), CommandSettings::new("cat"));
        config.default_provider = Some("local".to_string());

        let registry = config.build_registry();
        assert!(registry.is_configured("local"));
        assert_eq!(registry.primary_for(None).as_deref(), Some("local"));
    }

    #[test]
    fn test_explicit_paths_expand_home() {
        let config = Config {
            database_path: Some("/var/lib/genq/queue.db".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/var/lib/genq/queue.db")
        );
        assert!(config.output_directory().unwrap().ends_with("content"));
    }
}
