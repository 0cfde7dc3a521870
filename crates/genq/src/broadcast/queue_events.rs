//! Queue event broadcaster for real-time job and batch status streaming.
//!
//! This is also the observability sink for provider fallbacks: every time a
//! substitute provider produced the text, a [`QueueEventKind::FallbackUsed`]
//! event is sent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::queue::ErrorKind;

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEventKind {
    JobSubmitted {
        job_id: String,
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
    },
    BatchSubmitted {
        batch_id: String,
        total_items: u32,
    },
    JobStarted {
        job_id: String,
        action: String,
        attempt: u32,
    },
    FallbackUsed {
        job_id: String,
        original: String,
        substitute: String,
    },
    JobCompleted {
        job_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    JobExpanded {
        job_id: String,
        children: usize,
    },
    RetryScheduled {
        job_id: String,
        attempt: u32,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    JobFailed {
        job_id: String,
        kind: ErrorKind,
        error: String,
    },
    JobRecovered {
        job_id: String,
        /// True when the job had no attempts left and was failed instead.
        exhausted: bool,
    },
    JobCancelled {
        job_id: String,
    },
    BatchCompleted {
        batch_id: String,
        completed_items: u32,
        failed_items: u32,
    },
    BatchCancelled {
        batch_id: String,
        cancelled_jobs: usize,
    },
}

/// A timestamped queue event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: QueueEventKind,
}

impl QueueEvent {
    pub fn new(kind: QueueEventKind, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, kind }
    }
}

/// Broadcasts queue events to any number of subscribers.
#[derive(Clone)]
pub struct QueueEventBroadcaster {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl QueueEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: QueueEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Stamps and sends an event.
    pub fn emit(&self, kind: QueueEventKind, at: DateTime<Utc>) {
        log::debug!("queue event: {:?}", kind);
        self.send(QueueEvent::new(kind, at));
    }

    /// Creates a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for QueueEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
