//! In-process test doubles for the two external seams: a scripted
//! generation backend and an in-memory content store.
//!
//! Both record what they were asked to do so tests can assert on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::content::{ContentStore, ContentStoreError, NewArtifact};
use crate::provider::{GenerationBackend, GenerationError, GenerationRequest};

type Reply = Result<String, GenerationError>;

/// A backend that answers from a script instead of calling a provider.
///
/// Resolution order per call: prompt rules, queued replies, the default
/// error, the default reply, then an echo of the prompt.
pub struct ScriptedBackend {
    provider: String,
    configured: bool,
    latency: Duration,
    default_reply: Option<String>,
    default_error: Option<GenerationError>,
    rules: Vec<(String, GenerationError)>,
    queued: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            configured: true,
            latency: Duration::ZERO,
            default_reply: None,
            default_error: None,
            rules: Vec::new(),
            queued: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A backend that reports missing credentials.
    pub fn unconfigured(provider: impl Into<String>) -> Self {
        Self {
            configured: false,
            ..Self::new(provider)
        }
    }

    pub fn with_default_reply(mut self, reply: &str) -> Self {
        self.default_reply = Some(reply.to_string());
        self
    }

    /// Every call fails with `error` unless a rule or queued reply says
    /// otherwise.
    pub fn failing_with(mut self, error: GenerationError) -> Self {
        self.default_error = Some(error);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails any call whose prompt contains `needle`.
    pub fn fail_when_prompt_contains(mut self, needle: &str, error: GenerationError) -> Self {
        self.rules.push((needle.to_string(), error));
        self
    }

    /// Queues a one-shot reply for the next unmatched call.
    pub fn push_reply(&self, reply: Reply) {
        lock(&self.queued).push_back(reply);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests).iter().map(|r| r.prompt.clone()).collect()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        lock(&self.requests).push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some((_, error)) = self
            .rules
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle.as_str()))
        {
            return Err(error.clone());
        }
        if let Some(reply) = lock(&self.queued).pop_front() {
            return reply;
        }
        if let Some(error) = &self.default_error {
            return Err(error.clone());
        }
        Ok(self
            .default_reply
            .clone()
            .unwrap_or_else(|| format!("{} says: {}", self.provider, request.prompt)))
    }
}

/// Keeps artifacts in memory under ids `artifact-1`, `artifact-2`, ...
#[derive(Default)]
pub struct MemoryContentStore {
    next_id: AtomicUsize,
    artifacts: Mutex<Vec<(String, NewArtifact)>>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `create_artifact` call fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        *lock(&self.fail_next) = Some(reason.to_string());
    }

    pub fn get(&self, id: &str) -> Option<NewArtifact> {
        lock(&self.artifacts)
            .iter()
            .find(|(stored, _)| stored == id)
            .map(|(_, artifact)| artifact.clone())
    }

    /// Stored artifacts in creation order.
    pub fn artifacts(&self) -> Vec<(String, NewArtifact)> {
        lock(&self.artifacts).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.artifacts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn create_artifact(&self, artifact: &NewArtifact) -> Result<String, ContentStoreError> {
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(ContentStoreError::Rejected(reason));
        }
        let id = format!("artifact-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.artifacts).push((id.clone(), artifact.clone()));
        Ok(id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_backend_resolution_order() {
        let backend = ScriptedBackend::new("openai")
            .with_default_reply("default")
            .fail_when_prompt_contains("boom", GenerationError::Unavailable("503".into()));
        backend.push_reply(Ok("queued".into()));

        let ask = |p: &str| GenerationRequest::new(p);
        assert!(backend.generate(&ask("boom now")).await.is_err());
        assert_eq!(backend.generate(&ask("a")).await.unwrap(), "queued");
        assert_eq!(backend.generate(&ask("b")).await.unwrap(), "default");
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.prompts()[0], "boom now");
    }

    #[tokio::test]
    async fn test_memory_store_fail_next_is_one_shot() {
        let store = MemoryContentStore::new();
        let artifact = NewArtifact {
            title: "T".into(),
            body: "B".into(),
            settings: Default::default(),
        };
        store.fail_next("nope");
        assert!(store.create_artifact(&artifact).await.is_err());
        let id = store.create_artifact(&artifact).await.unwrap();
        assert_eq!(id, "artifact-1");
        assert_eq!(store.get(&id).unwrap().title, "T");
        assert_eq!(store.len(), 1);
    }
}
