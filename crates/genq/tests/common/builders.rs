//! Builders for harness settings and job payloads.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use genq::provider::{FallbackTable, ProviderRegistry};
use genq::queue::{DispatcherConfig, ExecutionMode, ExecutorConfig, RetryPolicy};
use genq::testing::ScriptedBackend;

use super::harness::TestHarness;

/// Builder for a [`TestHarness`].
///
/// Defaults differ from production where it keeps tests short: backoff base
/// of one second and no stagger between bulk items.
pub struct HarnessBuilder {
    backends: Vec<Arc<ScriptedBackend>>,
    default_provider: Option<String>,
    fallbacks: Option<FallbackTable>,
    dispatcher: DispatcherConfig,
    executor: ExecutorConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            default_provider: None,
            fallbacks: None,
            dispatcher: DispatcherConfig {
                retry: RetryPolicy::new(3, Duration::from_secs(1)),
                ..DispatcherConfig::default()
            },
            executor: ExecutorConfig {
                stagger: Duration::ZERO,
                call_timeout: Duration::from_secs(5),
                ..ExecutorConfig::default()
            },
        }
    }

    pub fn backend(mut self, backend: ScriptedBackend) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    /// Registers a backend the test keeps a handle to.
    pub fn shared_backend(mut self, backend: Arc<ScriptedBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn default_provider(mut self, provider: &str) -> Self {
        self.default_provider = Some(provider.to_string());
        self
    }

    pub fn fallbacks(mut self, table: FallbackTable) -> Self {
        self.fallbacks = Some(table);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.dispatcher.retry.max_attempts = max_attempts;
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.dispatcher.batch_size = batch_size;
        self
    }

    pub fn stagger(mut self, stagger: Duration) -> Self {
        self.executor.stagger = stagger;
        self
    }

    pub fn per_provider(mut self, max_concurrency: usize) -> Self {
        self.dispatcher.execution_mode = ExecutionMode::PerProvider;
        self.dispatcher.max_concurrency = max_concurrency;
        self
    }

    pub fn fail_fast_on_rejected(mut self) -> Self {
        self.executor.fail_fast_on_rejected = true;
        self
    }

    pub fn build(self) -> TestHarness {
        let mut registry = ProviderRegistry::new();
        for backend in self.backends {
            registry.register(backend);
        }
        if let Some(default) = self.default_provider {
            registry = registry.with_default_provider(default);
        }
        if let Some(table) = self.fallbacks {
            registry = registry.with_fallbacks(table);
        }
        TestHarness::from_parts(registry, self.dispatcher, self.executor)
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `generate_content`-style payloads.
pub struct PayloadBuilder {
    value: serde_json::Map<String, Value>,
}

impl PayloadBuilder {
    pub fn topic(topic: &str) -> Self {
        let mut value = serde_json::Map::new();
        value.insert("topic".to_string(), json!(topic));
        Self { value }
    }

    pub fn topics(topics: &[&str]) -> Self {
        let mut value = serde_json::Map::new();
        value.insert("topics".to_string(), json!(topics));
        Self { value }
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.value.insert("provider".to_string(), json!(provider));
        self
    }

    pub fn template(mut self, template: &str) -> Self {
        self.value.insert("template".to_string(), json!(template));
        self
    }

    pub fn param(mut self, name: &str, value: Value) -> Self {
        let params = self
            .value
            .entry("params")
            .or_insert_with(|| json!({}));
        if let Some(params) = params.as_object_mut() {
            params.insert(name.to_string(), value);
        }
        self
    }

    pub fn artifact_id(mut self, id: &str) -> Self {
        self.value.insert("artifact_id".to_string(), json!(id));
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.value)
    }
}
