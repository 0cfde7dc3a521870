//! The public queue API: enqueue, status and admin controls.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::broadcast::{QueueEvent, QueueEventBroadcaster, QueueEventKind};
use crate::clock::{Clock, SystemClock};
use crate::content::ContentStore;
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{format_timestamp, parse_timestamp, settings_repo, Database};
use crate::error::{QueueError, Result};
use crate::provider::ProviderRegistry;

use super::batch::{new_batch_id, Batch, BatchProgress, BatchTracker};
use super::dispatcher::{Dispatcher, DispatcherConfig, SweepSummary, TickReport};
use super::executor::{ExecutorConfig, JobExecutor};
use super::job::{fan_out, BulkPayload, GenerationPayload, Job, JobAction, JobStatus, NewJob};

/// Optional knobs for [`Queue::submit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Higher runs first.
    pub priority: i64,
    /// Earliest start, relative to now.
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Pending jobs waiting for another attempt.
    pub retry_count: u64,
    pub is_paused: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
}

pub struct QueueBuilder {
    db: Database,
    registry: ProviderRegistry,
    store: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    events: QueueEventBroadcaster,
    dispatcher: DispatcherConfig,
    executor: ExecutorConfig,
}

impl QueueBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, events: QueueEventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn build(self) -> Queue {
        let registry = Arc::new(self.registry);
        let batches = BatchTracker::new(self.db.clone(), self.clock.clone());
        let stagger = self.executor.stagger;
        let executor = Arc::new(JobExecutor::new(
            registry.clone(),
            self.store,
            self.events.clone(),
            self.clock.clone(),
            self.executor,
        ));
        let dispatcher = Dispatcher::new(
            self.db.clone(),
            self.clock.clone(),
            executor,
            batches.clone(),
            self.events.clone(),
            self.dispatcher,
        );

        Queue {
            db: self.db,
            clock: self.clock,
            registry,
            events: self.events,
            batches,
            dispatcher,
            stagger,
        }
    }
}

pub struct Queue {
    db: Database,
    clock: Arc<dyn Clock>,
    registry: Arc<ProviderRegistry>,
    events: QueueEventBroadcaster,
    batches: BatchTracker,
    dispatcher: Dispatcher,
    stagger: Duration,
}

impl Queue {
    pub fn builder(
        db: Database,
        registry: ProviderRegistry,
        store: Arc<dyn ContentStore>,
    ) -> QueueBuilder {
        QueueBuilder {
            db,
            registry,
            store,
            clock: Arc::new(SystemClock),
            events: QueueEventBroadcaster::default(),
            dispatcher: DispatcherConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    /// Rejects work that could never run: neither the provider it would
    /// start with nor any of that provider's fallbacks has credentials.
    fn ensure_provider(&self, requested: Option<&str>) -> Result<()> {
        let Some(primary) = self.registry.primary_for(requested) else {
            return Err(QueueError::NoConfiguredProvider);
        };
        if self.registry.is_configured(&primary)
            || !self.registry.fallback_candidates(&primary).is_empty()
        {
            Ok(())
        } else {
            Err(QueueError::NoConfiguredProvider)
        }
    }

    /// Enqueues one job and returns its id.
    ///
    /// A `bulk_expand` job gets its own batch, sized by its topic list; its
    /// items are created when a tick runs it.
    pub fn submit(
        &self,
        action: JobAction,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<String> {
        let mut job = NewJob::new(action, payload)
            .priority(options.priority)
            .delay(options.delay);

        if action == JobAction::BulkExpand {
            let bulk = BulkPayload::parse(&job.payload).map_err(QueueError::InvalidPayload)?;
            self.ensure_provider(bulk.provider.as_deref())?;
            job.payload = serde_json::to_value(&bulk)
                .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
            let total = u32::try_from(bulk.topics.len())
                .map_err(|_| QueueError::InvalidPayload("too many topics".to_string()))?;
            let batch_id = new_batch_id();
            let row = job.batch(batch_id.clone()).into_row(self.clock.now());
            self.batches.create_with_jobs(&batch_id, total, std::slice::from_ref(&row))?;
            self.events.emit(
                QueueEventKind::BatchSubmitted {
                    batch_id,
                    total_items: total,
                },
                self.clock.now(),
            );
            return Ok(self.submitted(action, row));
        }

        let parsed =
            GenerationPayload::parse(action, &job.payload).map_err(QueueError::InvalidPayload)?;
        self.ensure_provider(parsed.provider.as_deref())?;
        let row = job.into_row(self.clock.now());
        job_repo::insert(&self.db, &row)?;
        Ok(self.submitted(action, row))
    }

    fn submitted(&self, action: JobAction, row: JobRow) -> String {
        log::info!("Submitted {} job {}", action, row.id);
        self.events.emit(
            QueueEventKind::JobSubmitted {
                job_id: row.id.clone(),
                action: row.action.clone(),
                batch_id: row.batch_id.clone(),
            },
            self.clock.now(),
        );
        row.id
    }

    /// Enqueues one `generate_content` job per topic under a new batch and
    /// returns the batch id. Items are staggered through `scheduled_at`;
    /// nothing is generated here.
    pub fn submit_bulk(&self, bulk: BulkPayload, priority: i64) -> Result<String> {
        let bulk = bulk.normalized().map_err(QueueError::InvalidPayload)?;
        self.ensure_provider(bulk.provider.as_deref())?;
        let total = u32::try_from(bulk.topics.len())
            .map_err(|_| QueueError::InvalidPayload("too many topics".to_string()))?;

        let batch_id = new_batch_id();
        let rows = fan_out(
            &bulk,
            Some(&batch_id),
            priority,
            self.clock.now(),
            self.stagger,
        )
        .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        self.batches.create_with_jobs(&batch_id, total, &rows)?;

        log::info!("Submitted batch {} with {} topic(s)", batch_id, total);
        self.events.emit(
            QueueEventKind::BatchSubmitted {
                batch_id: batch_id.clone(),
                total_items: total,
            },
            self.clock.now(),
        );
        Ok(batch_id)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        let row = job_repo::find_by_id(&self.db, id)?.ok_or_else(|| QueueError::job_not_found(id))?;
        Ok(Job::from_row(row)?)
    }

    /// Jobs matching `filter`, newest first, plus the total match count.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64)> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        let jobs = rows
            .into_iter()
            .map(Job::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    pub fn get_batch(&self, id: &str) -> Result<Batch> {
        self.batches
            .get(id)?
            .ok_or_else(|| QueueError::batch_not_found(id))
    }

    pub fn get_batch_status(&self, id: &str) -> Result<BatchProgress> {
        Ok(self.get_batch(id)?.progress())
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats> {
        let count = |status: JobStatus| job_repo::count_by_status(&self.db, status.as_str());
        let last_processed_at = settings_repo::get(&self.db, settings_repo::LAST_PROCESSED_AT)?
            .map(|s| parse_timestamp(&s))
            .transpose()?;

        Ok(QueueStats {
            total: job_repo::count_all(&self.db)?,
            pending: count(JobStatus::Pending)?,
            processing: count(JobStatus::Processing)?,
            completed: count(JobStatus::Completed)?,
            failed: count(JobStatus::Failed)?,
            cancelled: count(JobStatus::Cancelled)?,
            retry_count: job_repo::count_retrying(&self.db)?,
            is_paused: self.is_paused()?,
            last_processed_at,
        })
    }

    /// Stops scheduled ticks from doing anything. `force_tick` still runs.
    pub fn pause(&self) -> Result<()> {
        settings_repo::set(&self.db, settings_repo::PAUSED, "true", &self.now())?;
        log::info!("Queue paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        settings_repo::set(&self.db, settings_repo::PAUSED, "false", &self.now())?;
        log::info!("Queue resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> Result<bool> {
        Ok(settings_repo::get_flag(&self.db, settings_repo::PAUSED)?)
    }

    /// Puts failed jobs (of one batch, or all) back to `pending` with a
    /// fresh attempt budget. Returns how many were reset; zero is not an
    /// error.
    pub fn retry_failed(&self, batch_id: Option<&str>) -> Result<usize> {
        if let Some(id) = batch_id {
            self.get_batch(id)?;
        }

        let reset = job_repo::reset_failed(&self.db, batch_id, &self.now())?;

        let mut items_per_batch: BTreeMap<String, u32> = BTreeMap::new();
        for job in &reset {
            let Some(batch) = &job.batch_id else {
                continue;
            };
            match job.action.parse::<JobAction>() {
                Ok(action) if action.is_batch_item() => {
                    *items_per_batch.entry(batch.clone()).or_default() += 1;
                }
                // A failed expansion counted every item of its batch as failed.
                Ok(_) => {
                    if let Some(b) = self.batches.get(batch)? {
                        *items_per_batch.entry(batch.clone()).or_default() += b.failed_items;
                    }
                }
                Err(e) => log::warn!("Job {}: {}", job.id, e),
            }
        }
        for (batch, items) in items_per_batch {
            self.batches.on_retry(&batch, items)?;
        }

        if !reset.is_empty() {
            log::info!("Reset {} failed job(s) to pending", reset.len());
        }
        Ok(reset.len())
    }

    /// Deletes completed jobs. Batches keep their counters.
    pub fn clear_completed(&self) -> Result<usize> {
        let deleted = job_repo::delete_completed(&self.db)?;
        log::info!("Cleared {} completed job(s)", deleted);
        Ok(deleted)
    }

    /// Cancels every still-pending job of the batch and marks it cancelled.
    /// Jobs already processing finish normally.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<usize> {
        self.get_batch(batch_id)?;
        let cancelled = job_repo::cancel_pending_in_batch(&self.db, batch_id, &self.now())?;
        self.batches.cancel(batch_id)?;
        log::info!("Cancelled batch {} ({} pending job(s))", batch_id, cancelled);
        self.events.emit(
            QueueEventKind::BatchCancelled {
                batch_id: batch_id.to_string(),
                cancelled_jobs: cancelled,
            },
            self.clock.now(),
        );
        Ok(cancelled)
    }

    /// Cancels one pending job.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        let job = self.get_job(id)?;
        job_repo::update_status(
            &self.db,
            id,
            JobStatus::Pending.as_str(),
            JobStatus::Cancelled.as_str(),
            None,
            &self.now(),
        )?;

        if let Some(batch_id) = &job.batch_id {
            if job.action.is_batch_item() {
                self.batches.on_item_cancelled(batch_id)?;
            } else {
                // Without the expansion the batch can never finish.
                self.batches.cancel(batch_id)?;
            }
        }

        log::info!("Cancelled job {}", id);
        self.events.emit(
            QueueEventKind::JobCancelled {
                job_id: id.to_string(),
            },
            self.clock.now(),
        );
        Ok(())
    }

    /// A scheduled tick; a no-op while paused or while another tick holds
    /// the run lease.
    pub async fn tick(&self) -> Result<TickReport> {
        self.dispatcher.tick().await
    }

    /// Runs a tick now, even while paused.
    pub async fn force_tick(&self) -> Result<TickReport> {
        self.dispatcher.force_tick().await
    }

    /// Runs the stuck-job sweep outside a tick. `None` when a tick holds
    /// the run lease.
    pub fn sweep_stuck(&self) -> Result<Option<SweepSummary>> {
        self.dispatcher.sweep()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &QueueEventBroadcaster {
        &self.events
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}
