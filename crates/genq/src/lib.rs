//! genq: a durable job queue for topic-driven content generation.
//!
//! Jobs live in SQLite. An external trigger (cron, a timer) calls
//! [`Queue::tick`]; each tick takes a run lease, recovers stuck jobs, then
//! claims and executes a small batch of eligible jobs with retry, backoff
//! and provider fallback.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod logging;
pub mod provider;
pub mod queue;
pub mod secrets;
pub mod testing;

pub use broadcast::{QueueEvent, QueueEventBroadcaster, QueueEventKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, load_config_or_default, Config};
pub use content::{ContentStore, FileContentStore, NewArtifact};
pub use db::Database;
pub use error::{ConfigError, QueueError, Result};
pub use provider::{GenerationBackend, GenerationError, GenerationRequest, ProviderRegistry};
pub use queue::{
    BulkPayload, Job, JobAction, JobStatus, Queue, QueueBuilder, QueueStats, SubmitOptions,
    TickReport,
};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
