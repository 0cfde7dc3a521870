use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::schema::{Config, CONFIG_VERSION};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

/// `~/.genq/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".genq").join("config.json"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Loads the config at `path` if given, else the default path if that file
/// exists, else the built-in defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        return load_config(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => load_config(path),
        _ => Ok(Config::default()),
    }
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.queue.batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "queue.batch_size must be at least 1".to_string(),
        });
    }
    if config.queue.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "queue.max_attempts must be at least 1".to_string(),
        });
    }
    if config.queue.max_concurrency == 0 {
        return Err(ConfigError::Validation {
            message: "queue.max_concurrency must be at least 1".to_string(),
        });
    }

    for (id, provider) in &config.providers {
        if provider.program.trim().is_empty() {
            return Err(ConfigError::InvalidProvider {
                id: id.clone(),
                reason: "program must not be empty".to_string(),
            });
        }
    }

    // Providers the fallback table may name: configured ones plus the
    // built-in ids, which are simply skipped while unconfigured.
    let default_table = crate::provider::FallbackTable::default();
    let known: BTreeSet<&str> = config
        .providers
        .keys()
        .map(String::as_str)
        .chain(default_table.providers())
        .collect();

    if let Some(default) = &config.default_provider {
        if !config.providers.contains_key(default) {
            return Err(ConfigError::InvalidProvider {
                id: default.clone(),
                reason: "default_provider is not listed under providers".to_string(),
            });
        }
    }

    for (id, list) in &config.fallbacks {
        for candidate in std::iter::once(id).chain(list.iter()) {
            if !known.contains(candidate.as_str()) {
                return Err(ConfigError::InvalidProvider {
                    id: candidate.clone(),
                    reason: format!("unknown provider in fallbacks for '{}'", id),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::dispatcher::ExecutionMode;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database_path": "/tmp/genq.db",
            "queue": {
                "max_attempts": 5,
                "backoff_base_secs": 1,
                "batch_size": 10,
                "execution_mode": "per_provider",
                "max_concurrency": 2
            },
            "default_provider": "local",
            "providers": {
                "local": {
                    "program": "/usr/local/bin/generate",
                    "args": ["--fast"],
                    "api_key_env": "LOCAL_KEY"
                }
            },
            "fallbacks": { "local": ["openai"] },
            "content": { "output_directory": "/srv/content", "publish_status": "publish" },
            "logging": { "filter": "genq=debug", "format": "json" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.stagger_secs, 10);
        assert_eq!(config.queue.execution_mode, ExecutionMode::PerProvider);
        let local = &config.providers["local"];
        assert_eq!(local.args, vec!["--fast".to_string()]);
        assert_eq!(local.credential.api_key_env.as_deref(), Some("LOCAL_KEY"));
        assert_eq!(config.content.publish_status, "publish");
        assert_eq!(config.logging.format, crate::logging::LogFormat::Json);
    }

    #[test]
    fn test_invalid_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_schema_rejects_unknown_keys_and_bad_types() {
        let result = load_config_from_str(r#"{ "version": "1.0", "workers": 4 }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));

        let result = load_config_from_str(r#"{ "version": "1.0", "queue": { "batch_size": "five" } }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = load_config_from_str(r#"{ "version": "1.0", "queue": { "batch_size": 0 } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_default_provider() {
        let result = load_config_from_str(r#"{ "version": "1.0", "default_provider": "nope" }"#);
        assert!(matches!(result, Err(ConfigError::InvalidProvider { .. })));
    }

    #[test]
    fn test_unknown_fallback_candidate() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "fallbacks": { "openai": ["mystery"] } }"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidProvider { id, .. }) if id == "mystery"));
    }

    #[test]
    fn test_empty_program_rejected() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "providers": { "local": { "program": " " } } }"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidProvider { .. })));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "version": "1.0" }"#).unwrap();
        assert!(load_config_or_default(Some(&path)).is_ok());

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            load_config(&missing),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}
