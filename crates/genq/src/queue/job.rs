//! Job model, action payloads and prompt rendering.

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::add_duration;
use crate::content::ArtifactSettings;
use crate::db::job_repo::JobRow;
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};

pub const DEFAULT_TEMPLATE: &str = "Write a detailed article about {topic}.";

static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    GenerateContent,
    GenerateImage,
    RefreshContent,
    BulkExpand,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateContent => "generate_content",
            Self::GenerateImage => "generate_image",
            Self::RefreshContent => "refresh_content",
            Self::BulkExpand => "bulk_expand",
        }
    }

    /// Whether a job with this action counts as one batch item.
    pub fn is_batch_item(&self) -> bool {
        !matches!(self, Self::BulkExpand)
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate_content" => Ok(Self::GenerateContent),
            "generate_image" => Ok(Self::GenerateImage),
            "refresh_content" => Ok(Self::RefreshContent),
            "bulk_expand" => Ok(Self::BulkExpand),
            other => Err(format!("unknown job action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Why the last attempt of a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Every provider tried returned an error.
    Generation,
    /// The last provider tried did not answer in time.
    Timeout,
    /// Generation worked, persisting the artifact did not.
    ContentStore,
    /// No provider in the chain has credentials.
    Configuration,
    /// Every provider tried rejected the request.
    Rejected,
    /// Found in `processing` past the lease TTL.
    Stuck,
    InvalidPayload,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Timeout => "timeout",
            Self::ContentStore => "content_store",
            Self::Configuration => "configuration",
            Self::Rejected => "rejected",
            Self::Stuck => "stuck",
            Self::InvalidPayload => "invalid_payload",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generation" => Ok(Self::Generation),
            "timeout" => Ok(Self::Timeout),
            "content_store" => Ok(Self::ContentStore),
            "configuration" => Ok(Self::Configuration),
            "rejected" => Ok(Self::Rejected),
            "stuck" => Ok(Self::Stuck),
            "invalid_payload" => Ok(Self::InvalidPayload),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown error kind '{}'", other)),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub action: JobAction,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub batch_id: Option<String>,
    pub artifact_id: Option<String>,
    pub provider_used: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn corrupt(what: &str, id: &str, reason: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Corrupt {
        reason: format!("job '{}' has invalid {}: {}", id, what, reason),
    }
}

fn parse_optional(value: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value.map(parse_timestamp).transpose()
}

impl Job {
    pub fn from_row(row: JobRow) -> Result<Self, DatabaseError> {
        let action = row
            .action
            .parse()
            .map_err(|e| corrupt("action", &row.id, e))?;
        let status = row
            .status
            .parse()
            .map_err(|e| corrupt("status", &row.id, e))?;
        let payload =
            serde_json::from_str(&row.payload).map_err(|e| corrupt("payload", &row.id, e))?;
        // Unknown kinds from newer versions are dropped rather than failing the read.
        let error_kind = row.error_kind.as_deref().and_then(|k| k.parse().ok());

        Ok(Self {
            action,
            status,
            payload,
            error_kind,
            priority: row.priority,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            batch_id: row.batch_id,
            artifact_id: row.artifact_id,
            provider_used: row.provider_used,
            created_at: parse_timestamp(&row.created_at)?,
            scheduled_at: parse_timestamp(&row.scheduled_at)?,
            started_at: parse_optional(row.started_at.as_deref())?,
            updated_at: parse_timestamp(&row.updated_at)?,
            completed_at: parse_optional(row.completed_at.as_deref())?,
            id: row.id,
        })
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Provider requested in the payload, if any.
    pub fn requested_provider(&self) -> Option<&str> {
        self.payload.get("provider").and_then(|v| v.as_str())
    }
}

/// Payload of `generate_content`, `generate_image` and `refresh_content`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub settings: ArtifactSettings,
    /// Artifact being refreshed (`refresh_content` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
}

impl GenerationPayload {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Parses and checks a payload for `action`.
    pub fn parse(action: JobAction, payload: &serde_json::Value) -> Result<Self, String> {
        let parsed: Self =
            serde_json::from_value(payload.clone()).map_err(|e| format!("malformed payload: {}", e))?;
        if parsed.topic.trim().is_empty() {
            return Err("topic must not be empty".to_string());
        }
        if action == JobAction::RefreshContent
            && parsed.artifact_id.as_deref().unwrap_or("").is_empty()
        {
            return Err("refresh_content requires an artifact_id".to_string());
        }
        Ok(parsed)
    }

    /// The final prompt: the template with `{topic}`, `{keyword}` and every
    /// scalar param substituted. Unknown placeholders are left as written.
    pub fn render_prompt(&self) -> String {
        let template = self
            .template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_TEMPLATE);
        render_template(template, &self.topic, &self.params)
    }
}

pub fn render_template(
    template: &str,
    topic: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> String {
    RE_PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match name {
                "topic" | "keyword" => topic.to_string(),
                _ => match params.get(name) {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => {
                        v.to_string()
                    }
                    _ => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Payload of `bulk_expand` and of `Queue::submit_bulk`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkPayload {
    pub topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub settings: ArtifactSettings,
}

impl BulkPayload {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Parses a payload, trims topics and drops blank ones.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, String> {
        let parsed: Self =
            serde_json::from_value(payload.clone()).map_err(|e| format!("malformed payload: {}", e))?;
        parsed.normalized()
    }

    pub fn normalized(mut self) -> Result<Self, String> {
        self.topics = self
            .topics
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if self.topics.is_empty() {
            return Err("at least one non-empty topic is required".to_string());
        }
        Ok(self)
    }

    fn item(&self, topic: &str) -> GenerationPayload {
        GenerationPayload {
            topic: topic.to_string(),
            template: self.template.clone(),
            provider: self.provider.clone(),
            params: self.params.clone(),
            settings: self.settings.clone(),
            artifact_id: None,
        }
    }
}

/// A job to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub action: JobAction,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub delay: Duration,
    pub batch_id: Option<String>,
}

impl NewJob {
    pub fn new(action: JobAction, payload: serde_json::Value) -> Self {
        Self {
            action,
            payload,
            priority: 0,
            delay: Duration::ZERO,
            batch_id: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// A fresh `pending` row with a new id, eligible at `now + delay`.
    pub fn into_row(self, now: DateTime<Utc>) -> JobRow {
        let created = format_timestamp(now);
        JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            action: self.action.as_str().to_string(),
            payload: self.payload.to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            priority: self.priority,
            attempts: 0,
            last_error: None,
            error_kind: None,
            batch_id: self.batch_id,
            artifact_id: None,
            provider_used: None,
            scheduled_at: format_timestamp(add_duration(now, self.delay)),
            updated_at: created.clone(),
            created_at: created,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Expands a bulk payload into one `generate_content` job per topic.
///
/// Item `i` becomes eligible at `start + i * stagger`, so the rate-limit
/// spacing lives in `scheduled_at` instead of a sleep inside the tick.
pub fn fan_out(
    bulk: &BulkPayload,
    batch_id: Option<&str>,
    priority: i64,
    start: DateTime<Utc>,
    stagger: Duration,
) -> Result<Vec<JobRow>, serde_json::Error> {
    bulk.topics
        .iter()
        .enumerate()
        .map(|(i, topic)| {
            let payload = serde_json::to_value(bulk.item(topic))?;
            let mut job = NewJob::new(JobAction::GenerateContent, payload)
                .priority(priority)
                .delay(stagger.saturating_mul(u32::try_from(i).unwrap_or(u32::MAX)));
            job.batch_id = batch_id.map(str::to_string);
            // Distinct created_at per item so equal-priority items run in topic order.
            let mut row = job.into_row(start);
            row.created_at = format_timestamp(add_duration(start, Duration::from_micros(i as u64)));
            Ok(row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_action_and_status_round_trip_strings() {
        for action in [
            JobAction::GenerateContent,
            JobAction::GenerateImage,
            JobAction::RefreshContent,
            JobAction::BulkExpand,
        ] {
            assert_eq!(action.as_str().parse::<JobAction>().unwrap(), action);
        }
        assert!("publish".parse::<JobAction>().is_err());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_render_prompt_default_template() {
        let payload = GenerationPayload::new("async rust");
        assert_eq!(
            payload.render_prompt(),
            "Write a detailed article about async rust."
        );
    }

    #[test]
    fn test_render_prompt_substitutes_params() {
        let payload: GenerationPayload = serde_json::from_value(json!({
            "topic": "tokio",
            "template": "Write {words} words on {keyword} for {audience}. Keep {unknown}.",
            "params": {"words": 800, "audience": "beginners", "nested": {"a": 1}}
        }))
        .unwrap();
        assert_eq!(
            payload.render_prompt(),
            "Write 800 words on tokio for beginners. Keep {unknown}."
        );
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(GenerationPayload::parse(JobAction::GenerateContent, &json!({"topic": "  "})).is_err());
        assert!(GenerationPayload::parse(JobAction::GenerateContent, &json!({"nope": 1})).is_err());
        assert!(GenerationPayload::parse(JobAction::RefreshContent, &json!({"topic": "x"})).is_err());
        assert!(GenerationPayload::parse(
            JobAction::RefreshContent,
            &json!({"topic": "x", "artifact_id": "a-1"})
        )
        .is_ok());
    }

    #[test]
    fn test_bulk_parse_drops_blank_topics() {
        let bulk = BulkPayload::parse(&json!({"topics": [" a ", "", "b"]})).unwrap();
        assert_eq!(bulk.topics, vec!["a", "b"]);
        assert!(BulkPayload::parse(&json!({"topics": ["  "]})).is_err());
    }

    #[test]
    fn test_fan_out_staggers_items() {
        let mut bulk = BulkPayload::new(["one", "two", "three"]);
        bulk.template = Some("About {topic}".to_string());
        let rows = fan_out(&bulk, Some("batch-1"), 3, start(), Duration::from_secs(10)).unwrap();

        assert_eq!(rows.len(), 3);
        let scheduled: Vec<&str> = rows.iter().map(|r| r.scheduled_at.as_str()).collect();
        assert_eq!(
            scheduled,
            vec![
                "2026-01-01T12:00:00.000000Z",
                "2026-01-01T12:00:10.000000Z",
                "2026-01-01T12:00:20.000000Z",
            ]
        );
        assert!(rows.iter().all(|r| r.batch_id.as_deref() == Some("batch-1")));
        assert!(rows.iter().all(|r| r.priority == 3 && r.action == "generate_content"));
        assert!(rows[0].created_at < rows[1].created_at);

        let payload: GenerationPayload = serde_json::from_str(&rows[1].payload).unwrap();
        assert_eq!(payload.topic, "two");
        assert_eq!(payload.template.as_deref(), Some("About {topic}"));
    }

    #[test]
    fn test_new_job_row() {
        let row = NewJob::new(JobAction::GenerateImage, json!({"topic": "cat"}))
            .priority(7)
            .delay(Duration::from_secs(60))
            .into_row(start());
        assert_eq!(row.status, "pending");
        assert_eq!(row.priority, 7);
        assert_eq!(row.scheduled_at, "2026-01-01T12:01:00.000000Z");

        let job = Job::from_row(row).unwrap();
        assert_eq!(job.action, JobAction::GenerateImage);
        assert!(!job.is_eligible(start()));
        assert!(job.is_eligible(start() + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_from_row_rejects_corrupt_status() {
        let mut row = NewJob::new(JobAction::GenerateContent, json!({"topic": "x"})).into_row(start());
        row.status = "exploded".to_string();
        assert!(matches!(Job::from_row(row), Err(DatabaseError::Corrupt { .. })));
    }
}
