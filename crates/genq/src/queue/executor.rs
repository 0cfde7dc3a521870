//! Runs one job: prompt → generation (with fallback) → content store.
//!
//! Nothing escapes [`JobExecutor::execute`]: every failure comes back as an
//! [`ExecutionOutcome::Failed`] with a one-line message.

use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::{QueueEventBroadcaster, QueueEventKind};
use crate::clock::Clock;
use crate::content::{tags, ContentStore, NewArtifact, DEFAULT_PUBLISH_STATUS};
use crate::db::format_timestamp;
use crate::db::job_repo::JobRow;
use crate::provider::{GenerationError, GenerationRequest, ProviderRegistry};

use super::job::{fan_out, BulkPayload, ErrorKind, GenerationPayload, Job, JobAction};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Applied to every backend call and to the content store call.
    pub call_timeout: Duration,
    /// Spacing between items when a `bulk_expand` job fans out.
    pub stagger: Duration,
    /// Fail permanently when every provider tried rejected the request.
    pub fail_fast_on_rejected: bool,
    /// Used when the payload does not name a publish status.
    pub default_publish_status: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stagger: DEFAULT_STAGGER,
            fail_fast_on_rejected: false,
            default_publish_status: DEFAULT_PUBLISH_STATUS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Skip the retry policy and fail the job now.
    pub permanent: bool,
}

impl ExecutionFailure {
    pub(crate) fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            permanent: false,
        }
    }

    fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            permanent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        artifact_id: String,
        provider: String,
        fallback_from: Option<String>,
    },
    /// A `bulk_expand` job produced these child jobs.
    Expanded { children: Vec<JobRow> },
    Failed(ExecutionFailure),
    /// The claim was lost before the artifact was written. Nothing was
    /// stored and nothing should be recorded.
    Abandoned,
}

/// Text produced by some provider in the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub text: String,
    pub provider: String,
    /// The provider that was asked first, when a substitute answered.
    pub fallback_from: Option<String>,
}

pub struct JobExecutor {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn ContentStore>,
    events: QueueEventBroadcaster,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn ContentStore>,
        events: QueueEventBroadcaster,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The provider a job will be sent to first.
    pub fn provider_for(&self, job: &Job) -> Option<String> {
        self.registry.primary_for(job.requested_provider())
    }

    pub async fn execute(&self, job: &Job) -> ExecutionOutcome {
        self.execute_claimed(job, &|| true).await
    }

    /// Like [`execute`](Self::execute), but asks `still_claimed` right
    /// before writing the artifact and abandons the job when it says no.
    pub async fn execute_claimed(
        &self,
        job: &Job,
        still_claimed: &(dyn Fn() -> bool + Sync),
    ) -> ExecutionOutcome {
        match job.action {
            JobAction::BulkExpand => self.expand(job),
            _ => self.generate(job, still_claimed).await,
        }
    }

    fn expand(&self, job: &Job) -> ExecutionOutcome {
        let bulk = match BulkPayload::parse(&job.payload) {
            Ok(bulk) => bulk,
            Err(e) => {
                return ExecutionOutcome::Failed(ExecutionFailure::permanent(
                    ErrorKind::InvalidPayload,
                    e,
                ))
            }
        };
        match fan_out(
            &bulk,
            job.batch_id.as_deref(),
            job.priority,
            self.clock.now(),
            self.config.stagger,
        ) {
            Ok(children) => ExecutionOutcome::Expanded { children },
            Err(e) => ExecutionOutcome::Failed(ExecutionFailure::permanent(
                ErrorKind::Internal,
                format!("failed to build child jobs: {}", e),
            )),
        }
    }

    async fn generate(
        &self,
        job: &Job,
        still_claimed: &(dyn Fn() -> bool + Sync),
    ) -> ExecutionOutcome {
        let payload = match GenerationPayload::parse(job.action, &job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return ExecutionOutcome::Failed(ExecutionFailure::permanent(
                    ErrorKind::InvalidPayload,
                    e,
                ))
            }
        };

        let mut request = GenerationRequest {
            prompt: payload.render_prompt(),
            params: payload.params.clone(),
        };
        if job.action == JobAction::GenerateImage {
            request
                .params
                .insert("mode".to_string(), serde_json::Value::from("image"));
        }

        let Some(primary) = self.registry.primary_for(payload.provider.as_deref()) else {
            return ExecutionOutcome::Failed(ExecutionFailure::permanent(
                ErrorKind::Configuration,
                "no generation provider is configured",
            ));
        };

        let generated = match self.generate_with_fallback(&job.id, &primary, &request).await {
            Ok(generated) => generated,
            Err(failure) => return ExecutionOutcome::Failed(failure),
        };

        if !still_claimed() {
            log::warn!(
                "Job {}: claim lost after generation via {}; artifact not written",
                job.id,
                generated.provider
            );
            return ExecutionOutcome::Abandoned;
        }

        let artifact = self.build_artifact(job, &payload, &generated);
        match tokio::time::timeout(self.config.call_timeout, self.store.create_artifact(&artifact))
            .await
        {
            Ok(Ok(artifact_id)) => ExecutionOutcome::Completed {
                artifact_id,
                provider: generated.provider,
                fallback_from: generated.fallback_from,
            },
            Ok(Err(e)) => ExecutionOutcome::Failed(ExecutionFailure::retryable(
                ErrorKind::ContentStore,
                format!("generated via {} but storing failed: {}", generated.provider, e),
            )),
            Err(_) => ExecutionOutcome::Failed(ExecutionFailure::retryable(
                ErrorKind::ContentStore,
                format!(
                    "generated via {} but the content store timed out after {:?}",
                    generated.provider, self.config.call_timeout
                ),
            )),
        }
    }

    /// Calls `primary`, then each configured fallback in order, until one
    /// returns text. Fallbacks happen inside the current attempt.
    pub async fn generate_with_fallback(
        &self,
        job_id: &str,
        primary: &str,
        request: &GenerationRequest,
    ) -> Result<Generated, ExecutionFailure> {
        let chain = std::iter::once(primary.to_string())
            .chain(self.registry.fallback_candidates(primary));
        let mut errors: Vec<(String, GenerationError)> = Vec::new();

        for provider in chain {
            let Some(backend) = self.registry.get(&provider).filter(|b| b.is_configured()) else {
                log::debug!("Skipping provider '{}': not configured", provider);
                continue;
            };

            let result = match tokio::time::timeout(self.config.call_timeout, backend.generate(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(self.config.call_timeout)),
            };

            match result {
                Ok(text) => {
                    let fallback_from = (provider != primary).then(|| primary.to_string());
                    if let Some(original) = &fallback_from {
                        log::info!(
                            "Job {} generated via fallback provider '{}' after '{}' failed",
                            job_id,
                            provider,
                            original
                        );
                        self.events.emit(
                            QueueEventKind::FallbackUsed {
                                job_id: job_id.to_string(),
                                original: original.clone(),
                                substitute: provider.clone(),
                            },
                            self.clock.now(),
                        );
                    }
                    return Ok(Generated {
                        text,
                        provider,
                        fallback_from,
                    });
                }
                Err(e) => {
                    log::warn!("Job {}: provider '{}' failed: {}", job_id, provider, e);
                    errors.push((provider, e));
                }
            }
        }

        Err(self.classify(primary, errors))
    }

    fn classify(&self, primary: &str, errors: Vec<(String, GenerationError)>) -> ExecutionFailure {
        let Some((_, last)) = errors.last() else {
            return ExecutionFailure::permanent(
                ErrorKind::Configuration,
                format!(
                    "no configured provider among '{}' and its fallbacks",
                    primary
                ),
            );
        };

        let transient = errors.iter().any(|(_, e)| e.is_transient());
        let all_rejected = errors
            .iter()
            .all(|(_, e)| matches!(e, GenerationError::Rejected(_)));
        let kind = if all_rejected {
            ErrorKind::Rejected
        } else if errors
            .iter()
            .all(|(_, e)| matches!(e, GenerationError::NotConfigured(_)))
        {
            ErrorKind::Configuration
        } else if matches!(last, GenerationError::Timeout(_)) {
            ErrorKind::Timeout
        } else {
            ErrorKind::Generation
        };

        let detail = errors
            .iter()
            .map(|(p, e)| format!("{}: {}", p, e))
            .collect::<Vec<_>>()
            .join("; ");
        let message = format!("all providers failed ({})", detail);

        // Rejections are only final when configured so.
        if !transient && (kind == ErrorKind::Configuration || self.config.fail_fast_on_rejected) {
            ExecutionFailure::permanent(kind, message)
        } else {
            ExecutionFailure::retryable(kind, message)
        }
    }

    fn build_artifact(
        &self,
        job: &Job,
        payload: &GenerationPayload,
        generated: &Generated,
    ) -> NewArtifact {
        let mut settings = payload.settings.clone();
        settings
            .publish_status
            .get_or_insert_with(|| self.config.default_publish_status.clone());

        let metadata = &mut settings.metadata;
        metadata.insert(tags::ORIGIN.to_string(), tags::ORIGIN_VALUE.to_string());
        metadata.insert(tags::SOURCE_TOPIC.to_string(), payload.topic.clone());
        metadata.insert(
            tags::GENERATED_AT.to_string(),
            format_timestamp(self.clock.now()),
        );
        metadata.insert(tags::PROVIDER.to_string(), generated.provider.clone());
        if let Some(original) = &generated.fallback_from {
            metadata.insert(tags::FALLBACK_FROM.to_string(), original.clone());
        }
        match job.action {
            JobAction::RefreshContent => {
                if let Some(previous) = &payload.artifact_id {
                    metadata.insert(tags::REFRESH_OF.to_string(), previous.clone());
                }
            }
            JobAction::GenerateImage => {
                metadata.insert(tags::KIND.to_string(), "image".to_string());
            }
            _ => {}
        }

        NewArtifact {
            title: crate::content::derive_title(&generated.text, &payload.topic),
            body: generated.text.clone(),
            settings,
        }
    }
}
