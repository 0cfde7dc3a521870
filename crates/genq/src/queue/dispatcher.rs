//! The tick handler.
//!
//! One tick: pause check → run lease → stuck-job sweep → select eligible
//! jobs → claim, execute and record each → release lease → stamp
//! `last_processed_at`. A tick that cannot take the lease changes nothing.
//!
//! The lease is renewed before every claim and before every artifact write,
//! and each job gets less time than the lease TTL, so a running job is never
//! swept by the next tick. A tick that finds its lease gone stops.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::broadcast::{QueueEventBroadcaster, QueueEventKind};
use crate::clock::{add_duration, sub_duration, Clock};
use crate::db::{format_timestamp, job_repo, lease_repo, settings_repo, Database};
use crate::error::Result;

use super::batch::{BatchTracker, ItemOutcome, Recorded};
use super::executor::{ExecutionFailure, ExecutionOutcome, JobExecutor};
use super::job::{ErrorKind, Job, JobAction};
use super::retry::{RetryDecision, RetryPolicy};

pub const DEFAULT_BATCH_SIZE: u32 = 5;
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Name of the lease row shared by every process using the same database.
pub const TICK_LEASE: &str = "dispatcher";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One job after another, in selection order.
    #[default]
    Sequential,
    /// Jobs grouped by provider; groups run concurrently, each group in
    /// selection order.
    PerProvider,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: u32,
    pub lease_ttl: Duration,
    pub execution_mode: ExecutionMode,
    /// Provider groups running at once in `PerProvider` mode.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl DispatcherConfig {
    /// Wall-clock budget for one job, kept below the lease TTL.
    pub fn job_budget(&self) -> Duration {
        self.lease_ttl * 4 / 5
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            lease_ttl: DEFAULT_LEASE_TTL,
            execution_mode: ExecutionMode::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Paused,
    LeaseHeld {
        holder: String,
        expires_at: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Stuck jobs put back to `pending`.
    pub requeued: usize,
    /// Stuck jobs that had no attempts left.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub selected: usize,
    pub completed: usize,
    pub expanded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Selected but claimed elsewhere, or not recordable.
    pub skipped: usize,
    pub swept: SweepSummary,
    /// The run lease was taken over mid-tick; remaining jobs were left alone.
    pub lease_lost: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "details", rename_all = "snake_case")]
pub enum TickReport {
    Skipped(SkipReason),
    Ran(TickSummary),
}

impl TickReport {
    pub fn summary(&self) -> Option<&TickSummary> {
        match self {
            Self::Ran(summary) => Some(summary),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Completed,
    Expanded,
    Retried,
    Failed,
    Skipped,
    LeaseLost,
}

impl TickSummary {
    fn add(&mut self, result: JobResult) {
        match result {
            JobResult::Completed => self.completed += 1,
            JobResult::Expanded => self.expanded += 1,
            JobResult::Retried => self.retried += 1,
            JobResult::Failed => self.failed += 1,
            JobResult::Skipped => self.skipped += 1,
            JobResult::LeaseLost => {
                self.skipped += 1;
                self.lease_lost = true;
            }
        }
    }
}

pub struct Dispatcher {
    db: Database,
    clock: Arc<dyn Clock>,
    executor: Arc<JobExecutor>,
    batches: BatchTracker,
    events: QueueEventBroadcaster,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        executor: Arc<JobExecutor>,
        batches: BatchTracker,
        events: QueueEventBroadcaster,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            clock,
            executor,
            batches,
            events,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    /// A scheduled tick. Does nothing while the queue is paused.
    pub async fn tick(&self) -> Result<TickReport> {
        self.run(true).await
    }

    /// A tick that ignores the pause flag. Still respects the lease.
    pub async fn force_tick(&self) -> Result<TickReport> {
        self.run(false).await
    }

    async fn run(&self, honor_pause: bool) -> Result<TickReport> {
        let span = info_span!("tick", forced = !honor_pause);
        async move {
            if honor_pause && settings_repo::get_flag(&self.db, settings_repo::PAUSED)? {
                log::info!("Queue is paused; tick skipped");
                return Ok(TickReport::Skipped(SkipReason::Paused));
            }

            let holder = match self.acquire_lease()? {
                Ok(holder) => holder,
                Err(reason) => {
                    log::info!("Tick skipped: {:?}", reason);
                    return Ok(TickReport::Skipped(reason));
                }
            };

            let result = self.run_locked(&holder).await;
            self.release_lease(&holder);
            let summary = result?;

            settings_repo::set(
                &self.db,
                settings_repo::LAST_PROCESSED_AT,
                &self.now(),
                &self.now(),
            )?;
            log::info!(
                "Tick done: {} selected, {} completed, {} expanded, {} retried, {} failed, {} swept",
                summary.selected,
                summary.completed,
                summary.expanded,
                summary.retried,
                summary.failed,
                summary.swept.requeued + summary.swept.failed
            );
            Ok(TickReport::Ran(summary))
        }
        .instrument(span)
        .await
    }

    /// Takes the run lease. The inner `Err` carries why it is unavailable.
    fn acquire_lease(&self) -> Result<std::result::Result<String, SkipReason>> {
        let holder = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let expires_at = add_duration(now, self.config.lease_ttl);
        if lease_repo::try_acquire(
            &self.db,
            TICK_LEASE,
            &holder,
            &format_timestamp(now),
            &format_timestamp(expires_at),
        )? {
            return Ok(Ok(holder));
        }

        let reason = match lease_repo::current(&self.db, TICK_LEASE)? {
            Some(lease) => SkipReason::LeaseHeld {
                holder: lease.holder,
                expires_at: lease.expires_at,
            },
            // Released between our attempt and the lookup.
            None => SkipReason::LeaseHeld {
                holder: String::new(),
                expires_at: String::new(),
            },
        };
        Ok(Err(reason))
    }

    /// Extends the lease by a full TTL. `false` means another tick owns it.
    fn renew_lease(&self, holder: &str) -> Result<bool> {
        let expires_at = add_duration(self.clock.now(), self.config.lease_ttl);
        Ok(lease_repo::renew(
            &self.db,
            TICK_LEASE,
            holder,
            &format_timestamp(expires_at),
        )?)
    }

    /// True while this tick holds the lease and the job is still under the
    /// claim made at `claimed_at`.
    fn still_claimed(&self, holder: &str, id: &str, claimed_at: &str) -> bool {
        let check = self.renew_lease(holder).and_then(|renewed| {
            Ok(renewed && job_repo::is_claimed(&self.db, id, claimed_at)?)
        });
        check.unwrap_or_else(|e| {
            log::error!("Job {}: could not verify claim: {}", id, e);
            false
        })
    }

    fn release_lease(&self, holder: &str) {
        match lease_repo::release(&self.db, TICK_LEASE, holder) {
            Ok(true) => {}
            Ok(false) => log::warn!("Run lease was taken over before release"),
            Err(e) => log::error!("Failed to release run lease: {}", e),
        }
    }

    /// Runs the stuck-job sweep on its own, under the run lease.
    /// Returns `None` when a tick currently holds the lease.
    pub fn sweep(&self) -> Result<Option<SweepSummary>> {
        let holder = match self.acquire_lease()? {
            Ok(holder) => holder,
            Err(_) => return Ok(None),
        };
        let result = self.sweep_stuck();
        self.release_lease(&holder);
        result.map(Some)
    }

    async fn run_locked(&self, holder: &str) -> Result<TickSummary> {
        let mut summary = TickSummary {
            swept: self.sweep_stuck()?,
            ..Default::default()
        };

        let rows = job_repo::list_eligible(&self.db, &self.now(), u64::from(self.config.batch_size))?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Job::from_row(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    summary.add(self.fail_unreadable(&id, &e.to_string()));
                }
            }
        }
        summary.selected = jobs.len();

        let results = match self.config.execution_mode {
            ExecutionMode::Sequential => self.process_in_order(jobs, holder).await,
            ExecutionMode::PerProvider => self.process_by_provider(jobs, holder).await,
        };
        for result in results {
            summary.add(result);
        }

        Ok(summary)
    }

    /// Processes jobs one after another, stopping once the lease is lost.
    async fn process_in_order(&self, jobs: Vec<Job>, holder: &str) -> Vec<JobResult> {
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            let result = self.process(job, holder).await;
            results.push(result);
            if result == JobResult::LeaseLost {
                log::warn!("Run lease lost; ending tick early");
                break;
            }
        }
        results
    }

    async fn process_by_provider(&self, jobs: Vec<Job>, holder: &str) -> Vec<JobResult> {
        let mut groups: Vec<(String, Vec<Job>)> = Vec::new();
        for job in jobs {
            let provider = self.executor.provider_for(&job).unwrap_or_default();
            match groups.iter_mut().find(|(p, _)| *p == provider) {
                Some((_, group)) => group.push(job),
                None => groups.push((provider, vec![job])),
            }
        }

        stream::iter(groups)
            .map(|(provider, group)| async move {
                log::debug!("Running {} job(s) for provider '{}'", group.len(), provider);
                self.process_in_order(group, holder).await
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Claims, executes and records one job. Errors are logged, never
    /// propagated, so one job cannot stop the rest of the tick.
    async fn process(&self, job: Job, holder: &str) -> JobResult {
        let id = job.id.clone();
        match self.try_process(job, holder).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Job {}: could not record outcome: {}", id, e);
                JobResult::Skipped
            }
        }
    }

    async fn try_process(&self, job: Job, holder: &str) -> Result<JobResult> {
        if !self.renew_lease(holder)? {
            return Ok(JobResult::LeaseLost);
        }
        let Some(row) = job_repo::claim(&self.db, &job.id, &self.now())? else {
            log::debug!("Job {} was claimed elsewhere", job.id);
            return Ok(JobResult::Skipped);
        };
        let claimed_at = row.started_at.clone().unwrap_or_default();
        let job = Job::from_row(row)?;

        self.events.emit(
            QueueEventKind::JobStarted {
                job_id: job.id.clone(),
                action: job.action.to_string(),
                attempt: job.attempts,
            },
            self.clock.now(),
        );

        let span = info_span!(
            "job",
            job_id = %job.id,
            action = %job.action,
            attempt = job.attempts
        );
        let still_claimed = || self.still_claimed(holder, &job.id, &claimed_at);
        let budget = self.config.job_budget();
        let execution = self
            .executor
            .execute_claimed(&job, &still_claimed)
            .instrument(span);
        let outcome = match tokio::time::timeout(budget, execution).await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome::Failed(ExecutionFailure::retryable(
                ErrorKind::Timeout,
                format!("job exceeded its {:?} time budget", budget),
            )),
        };
        self.record(&job, &claimed_at, outcome)
    }

    fn record(&self, job: &Job, claimed_at: &str, outcome: ExecutionOutcome) -> Result<JobResult> {
        match outcome {
            ExecutionOutcome::Completed {
                artifact_id,
                provider,
                fallback_from,
            } => {
                job_repo::complete(
                    &self.db,
                    &job.id,
                    claimed_at,
                    Some(&artifact_id),
                    Some(&provider),
                    &self.now(),
                )?;
                log::info!(
                    "Job {} completed via {}{} (artifact {})",
                    job.id,
                    provider,
                    fallback_from
                        .map(|p| format!(" after {} failed", p))
                        .unwrap_or_default(),
                    artifact_id
                );
                self.events.emit(
                    QueueEventKind::JobCompleted {
                        job_id: job.id.clone(),
                        artifact_id: Some(artifact_id),
                        provider: Some(provider),
                    },
                    self.clock.now(),
                );
                self.record_batch_item(job, ItemOutcome::Completed)?;
                Ok(JobResult::Completed)
            }
            ExecutionOutcome::Expanded { children } => {
                job_repo::expand(&self.db, &job.id, claimed_at, &children, &self.now())?;
                log::info!("Job {} expanded into {} job(s)", job.id, children.len());
                self.events.emit(
                    QueueEventKind::JobExpanded {
                        job_id: job.id.clone(),
                        children: children.len(),
                    },
                    self.clock.now(),
                );
                Ok(JobResult::Expanded)
            }
            ExecutionOutcome::Failed(failure) => self.record_failure(job, claimed_at, failure),
            ExecutionOutcome::Abandoned => Ok(JobResult::LeaseLost),
        }
    }

    fn record_failure(
        &self,
        job: &Job,
        claimed_at: &str,
        failure: ExecutionFailure,
    ) -> Result<JobResult> {
        let decision = if failure.permanent {
            RetryDecision::GiveUp
        } else {
            self.config.retry.decide(job.attempts, self.clock.now())
        };

        match decision {
            RetryDecision::RetryAt(at) => {
                job_repo::schedule_retry(
                    &self.db,
                    &job.id,
                    claimed_at,
                    &format_timestamp(at),
                    &failure.message,
                    failure.kind.as_str(),
                    &self.now(),
                )?;
                log::warn!(
                    "Job {} attempt {}/{} failed ({}): {}; retrying at {}",
                    job.id,
                    job.attempts,
                    self.config.retry.max_attempts,
                    failure.kind,
                    failure.message,
                    format_timestamp(at)
                );
                self.events.emit(
                    QueueEventKind::RetryScheduled {
                        job_id: job.id.clone(),
                        attempt: job.attempts,
                        scheduled_at: at,
                        error: failure.message,
                    },
                    self.clock.now(),
                );
                Ok(JobResult::Retried)
            }
            RetryDecision::GiveUp => {
                // A configuration error does not use up an attempt.
                let attempts = (failure.kind == ErrorKind::Configuration)
                    .then(|| i64::from(job.attempts.saturating_sub(1)));
                job_repo::fail(
                    &self.db,
                    &job.id,
                    claimed_at,
                    &failure.message,
                    failure.kind.as_str(),
                    attempts,
                    &self.now(),
                )?;
                log::error!(
                    "Job {} failed permanently ({}): {}",
                    job.id,
                    failure.kind,
                    failure.message
                );
                self.events.emit(
                    QueueEventKind::JobFailed {
                        job_id: job.id.clone(),
                        kind: failure.kind,
                        error: failure.message,
                    },
                    self.clock.now(),
                );
                self.on_permanent_failure(job.action, job.batch_id.as_deref())?;
                Ok(JobResult::Failed)
            }
        }
    }

    /// Batch bookkeeping for a job that will never run again.
    fn on_permanent_failure(&self, action: JobAction, batch_id: Option<&str>) -> Result<()> {
        let Some(batch_id) = batch_id else {
            return Ok(());
        };
        if action.is_batch_item() {
            return self.record_batch_outcome(batch_id, ItemOutcome::Failed);
        }
        // The expansion never happened, so none of its items will report.
        let failed = self.batches.fail_remaining(batch_id)?;
        if failed > 0 {
            self.emit_batch_completed(batch_id)?;
        }
        Ok(())
    }

    fn record_batch_item(&self, job: &Job, outcome: ItemOutcome) -> Result<()> {
        match job.batch_id.as_deref() {
            Some(batch_id) if job.action.is_batch_item() => {
                self.record_batch_outcome(batch_id, outcome)
            }
            _ => Ok(()),
        }
    }

    fn record_batch_outcome(&self, batch_id: &str, outcome: ItemOutcome) -> Result<()> {
        if self.batches.on_job_terminal(batch_id, outcome)? == Recorded::BatchCompleted {
            self.emit_batch_completed(batch_id)?;
        }
        Ok(())
    }

    fn emit_batch_completed(&self, batch_id: &str) -> Result<()> {
        if let Some(batch) = self.batches.get(batch_id)? {
            log::info!(
                "Batch {} completed: {} completed, {} failed of {}",
                batch.id,
                batch.completed_items,
                batch.failed_items,
                batch.total_items
            );
            self.events.emit(
                QueueEventKind::BatchCompleted {
                    batch_id: batch.id,
                    completed_items: batch.completed_items,
                    failed_items: batch.failed_items,
                },
                self.clock.now(),
            );
        }
        Ok(())
    }

    /// Fails a selected row that cannot be decoded, so it stops being
    /// selected on every tick.
    fn fail_unreadable(&self, id: &str, reason: &str) -> JobResult {
        log::error!("Job {} is unreadable: {}", id, reason);
        let now = self.now();
        let result = job_repo::claim(&self.db, id, &now).and_then(|claimed| match claimed {
            Some(row) => job_repo::fail(
                &self.db,
                id,
                row.started_at.as_deref().unwrap_or(&now),
                &format!("unreadable job record: {}", reason),
                ErrorKind::Internal.as_str(),
                None,
                &now,
            )
            .map(|_| JobResult::Failed),
            None => Ok(JobResult::Skipped),
        });
        result.unwrap_or_else(|e| {
            log::error!("Job {}: could not fail unreadable record: {}", id, e);
            JobResult::Skipped
        })
    }

    /// Requeues jobs left in `processing` longer than the lease TTL. Jobs
    /// without attempts left are failed with kind `stuck`.
    pub fn sweep_stuck(&self) -> Result<SweepSummary> {
        let now = self.clock.now();
        let cutoff = sub_duration(now, self.config.lease_ttl);
        let stuck = job_repo::reset_stuck(
            &self.db,
            &format_timestamp(cutoff),
            i64::from(self.config.retry.max_attempts),
            &format_timestamp(now),
        )?;

        let mut summary = SweepSummary::default();
        for recovered in stuck {
            let job = recovered.job;
            self.events.emit(
                QueueEventKind::JobRecovered {
                    job_id: job.id.clone(),
                    exhausted: recovered.exhausted,
                },
                now,
            );
            if recovered.exhausted {
                log::error!("Job {} stuck in processing with no attempts left", job.id);
                summary.failed += 1;
                match job.action.parse::<JobAction>() {
                    Ok(action) => self.on_permanent_failure(action, job.batch_id.as_deref())?,
                    Err(e) => log::error!("Job {}: {}", job.id, e),
                }
            } else {
                log::warn!("Job {} was stuck in processing; requeued", job.id);
                summary.requeued += 1;
            }
        }
        Ok(summary)
    }
}
