//! Provider credential resolution from multiple sources.
//!
//! A credential can come from, in priority order:
//!
//! 1. **Direct value** - for quick local testing (`"api_key": "sk-..."`)
//! 2. **File reference** - Docker secrets pattern (`"api_key_file": "/run/secrets/openai"`)
//! 3. **Env var reference** - the usual production setup (`"api_key_env": "OPENAI_API_KEY"`)

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;

/// Error type for secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

/// Result type for secret resolution.
pub type Result<T> = std::result::Result<T, SecretError>;

/// Where a provider's credential lives, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl CredentialSource {
    /// Reads the credential from an environment variable.
    pub fn env(name: &str) -> Self {
        Self {
            api_key_env: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// True when at least one source is set, whether or not it resolves.
    pub fn is_present(&self) -> bool {
        has_secret_source(
            self.api_key.as_deref(),
            self.api_key_file.as_deref(),
            self.api_key_env.as_deref(),
        )
    }

    /// Resolves the credential; `Ok(None)` when no source is configured.
    pub fn resolve(&self) -> Result<Option<SecretString>> {
        resolve_secret_optional(
            self.api_key.as_deref(),
            self.api_key_file.as_deref(),
            self.api_key_env.as_deref(),
        )
    }
}

/// Resolves a secret from multiple sources in priority order:
/// 1. Direct value (if provided and non-empty)
/// 2. File contents (if path provided)
/// 3. Environment variable (if name provided)
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct {
        if !value.is_empty() {
            return Ok(SecretString::from(value.to_string()));
        }
    }

    if let Some(path) = file_path {
        if !path.is_empty() {
            let expanded = expand_home(path);
            return match fs::read_to_string(&expanded) {
                Ok(content) => Ok(SecretString::from(content.trim().to_string())),
                Err(e) => Err(SecretError::FileReadError {
                    path: expanded,
                    source: e,
                }),
            };
        }
    }

    if let Some(var_name) = env_var {
        if !var_name.is_empty() {
            return match std::env::var(var_name) {
                // Env vars may carry a trailing newline.
                Ok(value) => Ok(SecretString::from(value.trim())),
                Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                    name: var_name.to_string(),
                }),
                Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                    name: var_name.to_string(),
                }),
            };
        }
    }

    Err(SecretError::NoSourceProvided)
}

/// Resolves a secret, returning None if no source is provided instead of an error.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Checks if at least one secret source is configured (non-empty).
pub fn has_secret_source(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> bool {
    direct.is_some_and(|s| !s.is_empty())
        || file_path.is_some_and(|s| !s.is_empty())
        || env_var.is_some_and(|s| !s.is_empty())
}

/// Expands `~` to the user's home directory.
///
/// Only `~` and `~/path` are handled; `~user/path` is left unchanged.
pub(crate) fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy();
            if path == "~" {
                return home.into_owned();
            }
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // Tests that modify environment variables must run serially.
    #[test]
    #[serial]
    fn test_direct_value_takes_priority() {
        std::env::set_var("GENQ_TEST_SECRET_1", "env_value");
        let result =
            resolve_secret(Some("direct_value"), None, Some("GENQ_TEST_SECRET_1")).unwrap();
        assert_eq!(result.expose_secret(), "direct_value");
        std::env::remove_var("GENQ_TEST_SECRET_1");
    }

    #[test]
    #[serial]
    fn test_file_takes_priority_over_env() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "file_value").unwrap();

        std::env::set_var("GENQ_TEST_SECRET_2", "env_value");
        let result = resolve_secret(
            None,
            Some(temp_file.path().to_str().unwrap()),
            Some("GENQ_TEST_SECRET_2"),
        )
        .unwrap();
        assert_eq!(result.expose_secret(), "file_value");
        std::env::remove_var("GENQ_TEST_SECRET_2");
    }

    #[test]
    #[serial]
    fn test_env_var_fallback() {
        std::env::set_var("GENQ_TEST_SECRET_3", "  env_value\n");
        let result = resolve_secret(None, None, Some("GENQ_TEST_SECRET_3")).unwrap();
        assert_eq!(result.expose_secret(), "env_value");
        std::env::remove_var("GENQ_TEST_SECRET_3");
    }

    #[test]
    fn test_no_source_error() {
        let result = resolve_secret(None, None, None);
        assert!(matches!(result, Err(SecretError::NoSourceProvided)));
        assert!(resolve_secret(Some(""), Some(""), Some("")).is_err());
    }

    #[test]
    fn test_file_not_found_error() {
        let result = resolve_secret(None, Some("/nonexistent/path/to/secret"), None);
        assert!(matches!(result, Err(SecretError::FileReadError { .. })));
    }

    #[test]
    fn test_env_var_not_set_error() {
        let result = resolve_secret(None, None, Some("GENQ_DEFINITELY_NOT_SET_12345"));
        assert!(matches!(result, Err(SecretError::EnvVarNotSet { .. })));
    }

    #[test]
    #[serial]
    fn test_credential_source() {
        let empty = CredentialSource::default();
        assert!(!empty.is_present());
        assert!(empty.resolve().unwrap().is_none());

        std::env::set_var("GENQ_TEST_PROVIDER_KEY", "sk-test");
        let source = CredentialSource::env("GENQ_TEST_PROVIDER_KEY");
        assert!(source.is_present());
        let secret = source.resolve().unwrap().unwrap();
        assert_eq!(secret.expose_secret(), "sk-test");
        std::env::remove_var("GENQ_TEST_PROVIDER_KEY");

        assert!(matches!(source.resolve(), Err(SecretError::EnvVarNotSet { .. })));
    }

    #[test]
    fn test_credential_source_deserializes() {
        let source: CredentialSource =
            serde_json::from_str(r#"{"api_key_file": "/run/secrets/openai"}"#).unwrap();
        assert_eq!(source.api_key_file.as_deref(), Some("/run/secrets/openai"));
        assert!(source.api_key.is_none());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/absolute/path"), "/absolute/path");
        assert_eq!(expand_home("relative/path"), "relative/path");

        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy().into_owned();
            assert_eq!(expand_home("~/test"), format!("{}/test", home));
            assert_eq!(expand_home("~"), home);
        }
    }
}
