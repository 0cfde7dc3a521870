//! Generation backends, the provider registry and fallback resolution.
//!
//! Provider selection is always explicit: callers name the provider they
//! want and the registry hands back that backend. Nothing here keeps a
//! "current provider".

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod command;
pub mod fallback;

pub use command::{CommandBackend, CommandSettings};
pub use fallback::FallbackTable;

/// A single generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: serde_json::Map::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl GenerationError {
    /// Timeouts, rate limits and outages may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Unavailable(_)
        )
    }
}

/// One generation provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Provider identifier, e.g. `"openai"`.
    fn provider(&self) -> &str;

    /// True when the provider has usable credentials.
    fn is_configured(&self) -> bool;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

/// Backends by provider id, plus the fallback hierarchy between them.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    backends: BTreeMap<String, Arc<dyn GenerationBackend>>,
    default_provider: Option<String>,
    fallbacks: FallbackTable,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under its own provider id, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) -> &mut Self {
        self.backends.insert(backend.provider().to_string(), backend);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn with_default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: FallbackTable) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn get(&self, provider: &str) -> Option<&Arc<dyn GenerationBackend>> {
        self.backends.get(provider)
    }

    pub fn is_configured(&self, provider: &str) -> bool {
        self.get(provider).is_some_and(|b| b.is_configured())
    }

    /// Ids of every provider with usable credentials.
    pub fn configured(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|(_, b)| b.is_configured())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn has_any_configured(&self) -> bool {
        self.backends.values().any(|b| b.is_configured())
    }

    pub fn fallbacks(&self) -> &FallbackTable {
        &self.fallbacks
    }

    /// The provider a job starts with: the one it asked for, else the
    /// configured default, else the first configured provider.
    pub fn primary_for(&self, requested: Option<&str>) -> Option<String> {
        requested
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_provider.clone())
            .or_else(|| self.configured().first().map(|p| p.to_string()))
    }

    /// The providers to try after `failed`, skipping ones without credentials.
    pub fn fallback_candidates(&self, failed: &str) -> Vec<String> {
        self.fallbacks
            .candidates(failed)
            .into_iter()
            .filter(|p| self.is_configured(p))
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.backends.keys().collect::<Vec<_>>())
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with_backend(Arc::new(ScriptedBackend::new("openai")))
            .with_backend(Arc::new(ScriptedBackend::new("gemini")))
            .with_backend(Arc::new(ScriptedBackend::unconfigured("anthropic")))
    }

    #[test]
    fn test_configured_providers() {
        let registry = registry();
        assert_eq!(registry.configured(), vec!["gemini", "openai"]);
        assert!(registry.is_configured("openai"));
        assert!(!registry.is_configured("anthropic"));
        assert!(!registry.is_configured("deepseek"));
        assert!(registry.has_any_configured());
        assert!(!ProviderRegistry::new().has_any_configured());
    }

    #[test]
    fn test_primary_resolution() {
        let registry = registry();
        assert_eq!(registry.primary_for(Some("anthropic")).as_deref(), Some("anthropic"));
        assert_eq!(registry.primary_for(None).as_deref(), Some("gemini"));
        assert_eq!(registry.primary_for(Some("")).as_deref(), Some("gemini"));

        let registry = registry.with_default_provider("openai");
        assert_eq!(registry.primary_for(None).as_deref(), Some("openai"));
    }

    #[test]
    fn test_fallback_candidates_skip_unconfigured() {
        let registry = registry();
        // openai → [anthropic, gemini, deepseek, openrouter]
        assert_eq!(registry.fallback_candidates("openai"), vec!["gemini"]);
    }

    #[test]
    fn test_transient_errors() {
        assert!(GenerationError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(GenerationError::RateLimited("429".into()).is_transient());
        assert!(!GenerationError::Rejected("bad prompt".into()).is_transient());
        assert!(!GenerationError::NotConfigured("openai".into()).is_transient());
    }
}
