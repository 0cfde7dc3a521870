//! A provider backed by an external executable.
//!
//! The prompt is written to the child's stdin and the generated text is read
//! from its stdout. The credential travels in an environment variable, never
//! on the command line. Exit codes follow `sysexits.h`: 64/65 mean the
//! request was rejected, 75 means "try again later", anything else is an
//! outage.

use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{GenerationBackend, GenerationError, GenerationRequest};
use crate::secrets::CredentialSource;

const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_TEMPFAIL: i32 = 75;

fn default_credential_env() -> String {
    "GENQ_API_KEY".to_string()
}

/// How to run one command provider, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Name of the variable the child reads its credential from.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
    #[serde(flatten)]
    pub credential: CredentialSource,
}

impl CommandSettings {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            model: None,
            credential_env: default_credential_env(),
            credential: CredentialSource::default(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn credential(mut self, credential: CredentialSource) -> Self {
        self.credential = credential;
        self
    }
}

pub struct CommandBackend {
    provider: String,
    settings: CommandSettings,
    credential: Option<SecretString>,
    configured: bool,
}

impl CommandBackend {
    /// Builds the backend and resolves its credential once.
    ///
    /// A provider that declares no credential source is considered
    /// configured; one whose declared source cannot be resolved is not.
    pub fn new(provider: impl Into<String>, settings: CommandSettings) -> Self {
        let provider = provider.into();
        let (credential, configured) = match settings.credential.resolve() {
            Ok(Some(secret)) => {
                let usable = !secret.expose_secret().is_empty();
                (Some(secret), usable)
            }
            Ok(None) => (None, true),
            Err(e) => {
                log::warn!("Provider '{}' has no usable credential: {}", provider, e);
                (None, false)
            }
        };

        Self {
            provider,
            settings,
            credential,
            configured,
        }
    }

    fn command(&self, request: &GenerationRequest) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.args)
            .env("GENQ_PROVIDER", &self.provider)
            .env(
                "GENQ_PARAMS",
                serde_json::Value::Object(request.params.clone()).to_string(),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &self.settings.model {
            cmd.env("GENQ_MODEL", model);
        }
        if let Some(secret) = &self.credential {
            cmd.env(&self.settings.credential_env, secret.expose_secret());
        }
        cmd
    }
}

#[async_trait]
impl GenerationBackend for CommandBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        if !self.configured {
            return Err(GenerationError::NotConfigured(self.provider.clone()));
        }

        let mut child = self.command(request).spawn().map_err(|e| {
            GenerationError::Unavailable(format!(
                "failed to start '{}': {}",
                self.settings.program, e
            ))
        })?;

        // Feed stdin while draining stdout, or a child that answers as it
        // reads can block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(request.prompt.as_bytes()).await {
                // The child may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output =
            output.map_err(|e| GenerationError::Unavailable(format!("failed to wait: {}", e)))?;
        fed.map_err(|e| GenerationError::Unavailable(format!("failed to write prompt: {}", e)))?;

        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                return Err(GenerationError::Unavailable("empty output".to_string()));
            }
            return Ok(text);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| output.status.to_string());

        Err(match output.status.code() {
            Some(EX_USAGE) | Some(EX_DATAERR) => GenerationError::Rejected(detail),
            Some(EX_TEMPFAIL) => GenerationError::RateLimited(detail),
            _ => GenerationError::Unavailable(detail),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sh(script: &str) -> CommandSettings {
        CommandSettings::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_prompt_round_trips_through_stdin() {
        let backend = CommandBackend::new("local", CommandSettings::new("cat"));
        assert!(backend.is_configured());

        let text = backend
            .generate(&GenerationRequest::new("  hello from stdin \n"))
            .await
            .unwrap();
        assert_eq!(text, "hello from stdin");
    }

    #[tokio::test]
    async fn test_prompt_larger_than_pipe_buffer() {
        let backend = CommandBackend::new("local", CommandSettings::new("cat"));
        let prompt = "a".repeat(1 << 20);

        let text = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            backend.generate(&GenerationRequest::new(prompt.clone())),
        )
        .await
        .expect("child should not block on a full pipe")
        .unwrap();
        assert_eq!(text.len(), prompt.len());
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_errors() {
        let rejected = CommandBackend::new("local", sh("echo 'bad prompt' >&2; exit 65"));
        let err = rejected.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert_eq!(err, GenerationError::Rejected("bad prompt".to_string()));

        let limited = CommandBackend::new("local", sh("exit 75"));
        let err = limited.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, GenerationError::RateLimited(_)));

        let down = CommandBackend::new("local", CommandSettings::new("false"));
        let err = down.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_empty_output_is_unavailable() {
        let backend = CommandBackend::new("local", sh("cat > /dev/null"));
        let err = backend.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert_eq!(err, GenerationError::Unavailable("empty output".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let backend = CommandBackend::new("local", CommandSettings::new("/nonexistent/genq-bin"));
        let err = backend.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_credential_passed_in_env() {
        let settings = sh("printf %s \"$GENQ_API_KEY\"").credential(CredentialSource {
            api_key: Some("sk-direct".to_string()),
            ..Default::default()
        });
        let backend = CommandBackend::new("openai", settings);
        let text = backend.generate(&GenerationRequest::new("x")).await.unwrap();
        assert_eq!(text, "sk-direct");
    }

    #[tokio::test]
    #[serial]
    async fn test_unresolvable_credential_is_not_configured() {
        std::env::remove_var("GENQ_TEST_MISSING_KEY");
        let settings = CommandSettings::new("cat")
            .credential(CredentialSource::env("GENQ_TEST_MISSING_KEY"));
        let backend = CommandBackend::new("openai", settings);

        assert!(!backend.is_configured());
        let err = backend.generate(&GenerationRequest::new("x")).await.unwrap_err();
        assert_eq!(err, GenerationError::NotConfigured("openai".to_string()));
    }

    #[test]
    fn test_settings_deserialize_with_flattened_credential() {
        let settings: CommandSettings = serde_json::from_str(
            r#"{"program": "gen", "args": ["--fast"], "api_key_env": "OPENAI_API_KEY"}"#,
        )
        .unwrap();
        assert_eq!(settings.program, "gen");
        assert_eq!(settings.credential_env, "GENQ_API_KEY");
        assert_eq!(settings.credential.api_key_env.as_deref(), Some("OPENAI_API_KEY"));
    }
}
