//! Test harness for isolated queue runs.
//!
//! Everything is in process: SQLite in memory, time from a `ManualClock`,
//! generation from `ScriptedBackend`s and artifacts in a
//! `MemoryContentStore`. Ticks are driven explicitly by the test.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use genq::clock::{Clock, ManualClock};
use genq::db::job_repo::{self, JobFilter};
use genq::db::{format_timestamp, Database};
use genq::provider::ProviderRegistry;
use genq::queue::{
    BatchProgress, DispatcherConfig, ExecutorConfig, Job, JobStatus, Queue, TickReport,
    TickSummary,
};
use genq::testing::MemoryContentStore;
use genq::QueueEvent;

use super::builders::HarnessBuilder;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub struct TestHarness {
    pub db: Database,
    pub clock: ManualClock,
    pub store: Arc<MemoryContentStore>,
    pub queue: Queue,
    events: broadcast::Receiver<QueueEvent>,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    pub(crate) fn from_parts(
        registry: ProviderRegistry,
        dispatcher: DispatcherConfig,
        executor: ExecutorConfig,
    ) -> Self {
        let db = Database::open_in_memory().expect("in-memory database");
        let clock = ManualClock::new(start_time());
        let store = Arc::new(MemoryContentStore::new());
        let queue = Queue::builder(db.clone(), registry, store.clone())
            .clock(Arc::new(clock.clone()))
            .dispatcher_config(dispatcher)
            .executor_config(executor)
            .build();
        let events = queue.subscribe();

        Self {
            db,
            clock,
            store,
            queue,
            events,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Runs a scheduled tick and expects it to run.
    pub async fn tick(&self) -> TickSummary {
        match self.queue.tick().await.expect("tick") {
            TickReport::Ran(summary) => summary,
            TickReport::Skipped(reason) => panic!("tick skipped: {:?}", reason),
        }
    }

    pub fn job(&self, id: &str) -> Job {
        self.queue.get_job(id).expect("job exists")
    }

    pub fn batch(&self, id: &str) -> BatchProgress {
        self.queue.get_batch_status(id).expect("batch exists")
    }

    pub fn jobs_in_batch(&self, batch_id: &str) -> Vec<Job> {
        let filter = JobFilter {
            batch_id: Some(batch_id.to_string()),
            ..Default::default()
        };
        let (mut jobs, _) = self.queue.list_jobs(&filter).expect("list jobs");
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        job_repo::count_by_status(&self.db, status.as_str()).expect("count")
    }

    /// Puts a pending job into `processing` as if a tick had crashed
    /// mid-run.
    pub fn strand(&self, id: &str) {
        job_repo::claim(&self.db, id, &format_timestamp(self.now()))
            .expect("claim")
            .expect("job was pending");
    }

    /// Every event emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<QueueEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
