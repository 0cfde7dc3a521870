//! Batch model and the batch tracker.
//!
//! A batch owns no jobs. Jobs point at it by id, and the tracker folds their
//! terminal outcomes into the batch counters.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::db::batch_repo::{self, BatchRow};
use crate::db::job_repo::JobRow;
pub use crate::db::batch_repo::ItemOutcome;
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub id: String,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

impl Batch {
    pub fn from_row(row: BatchRow) -> Result<Self, DatabaseError> {
        let status = row.status.parse().map_err(|e| DatabaseError::Corrupt {
            reason: format!("batch '{}' has invalid status: {}", row.id, e),
        })?;
        Ok(Self {
            status,
            total_items: count(row.total_items),
            completed_items: count(row.completed_items),
            failed_items: count(row.failed_items),
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            id: row.id,
        })
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            id: self.id.clone(),
            total: self.total_items,
            completed: self.completed_items,
            failed: self.failed_items,
            progress_pct: progress_pct(self.completed_items, self.failed_items, self.total_items),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// What `GetBatchStatus` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub id: String,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub progress_pct: f64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

pub fn new_batch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `round((completed + failed) / total * 100, 2)`; an empty batch is 100%.
pub fn progress_pct(completed: u32, failed: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let pct = f64::from(completed + failed) / f64::from(total) * 100.0;
    (pct * 100.0).round() / 100.0
}

/// Result of recording one terminal job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Counted; the batch is still running.
    Counted,
    /// Counted, and it was the last item.
    BatchCompleted,
    /// Not counted: the batch was already full or does not exist.
    Ignored,
}

#[derive(Clone)]
pub struct BatchTracker {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl BatchTracker {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn now(&self) -> String {
        format_timestamp(self.clock.now())
    }

    /// Creates an empty batch expecting `total_items` outcomes.
    pub fn create(&self, total_items: u32) -> Result<String, DatabaseError> {
        let id = new_batch_id();
        batch_repo::insert(&self.db, &id, i64::from(total_items), &self.now())?;
        Ok(id)
    }

    /// Creates batch `id` and inserts its jobs in the same transaction.
    pub fn create_with_jobs(
        &self,
        id: &str,
        total_items: u32,
        jobs: &[JobRow],
    ) -> Result<(), DatabaseError> {
        batch_repo::insert_with_jobs(&self.db, id, i64::from(total_items), jobs, &self.now())
    }

    pub fn get(&self, batch_id: &str) -> Result<Option<Batch>, DatabaseError> {
        batch_repo::find_by_id(&self.db, batch_id)?
            .map(Batch::from_row)
            .transpose()
    }

    pub fn status(&self, batch_id: &str) -> Result<Option<BatchProgress>, DatabaseError> {
        Ok(self.get(batch_id)?.map(|b| b.progress()))
    }

    pub fn on_job_terminal(
        &self,
        batch_id: &str,
        outcome: ItemOutcome,
    ) -> Result<Recorded, DatabaseError> {
        if !batch_repo::record_outcome(&self.db, batch_id, outcome, &self.now())? {
            log::warn!("Batch {} is already full; outcome not counted", batch_id);
            return Ok(Recorded::Ignored);
        }
        let finished = self
            .get(batch_id)?
            .is_some_and(|b| {
                b.status == BatchStatus::Completed
                    && b.completed_items + b.failed_items >= b.total_items
            });
        Ok(if finished {
            Recorded::BatchCompleted
        } else {
            Recorded::Counted
        })
    }

    /// Counts every unfinished item as failed. Used when the job that was
    /// going to create the items failed for good.
    pub fn fail_remaining(&self, batch_id: &str) -> Result<u32, DatabaseError> {
        let failed = batch_repo::fail_remaining(&self.db, batch_id, &self.now())?;
        Ok(count(failed))
    }

    pub fn cancel(&self, batch_id: &str) -> Result<bool, DatabaseError> {
        batch_repo::mark_cancelled(&self.db, batch_id, &self.now())
    }

    /// Un-counts items that were put back to pending by a retry.
    pub fn on_retry(&self, batch_id: &str, items: u32) -> Result<(), DatabaseError> {
        batch_repo::decrement_failed(&self.db, batch_id, i64::from(items), &self.now())
    }

    /// One item was cancelled individually and will never report an outcome.
    pub fn on_item_cancelled(&self, batch_id: &str) -> Result<(), DatabaseError> {
        batch_repo::remove_item(&self.db, batch_id, &self.now())
    }
}
