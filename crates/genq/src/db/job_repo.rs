//! Job repository: per-record operations on the `jobs` table.
//!
//! Every status change is a single `UPDATE` guarded by the status the job
//! must currently be in, so a lost race shows up as
//! [`DatabaseError::InvalidTransition`] instead of a silent overwrite.
//! Outcome writes are additionally fenced by the claim's `started_at`, so a
//! worker whose job was swept and claimed again cannot record over the new
//! claim.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub action: String,
    pub payload: String,
    pub status: String,
    pub priority: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    pub batch_id: Option<String>,
    pub artifact_id: Option<String>,
    pub provider_used: Option<String>,
    pub created_at: String,
    pub scheduled_at: String,
    pub started_at: Option<String>,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            action: row.get("action")?,
            payload: row.get("payload")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            error_kind: row.get("error_kind")?,
            batch_id: row.get("batch_id")?,
            artifact_id: row.get("artifact_id")?,
            provider_used: row.get("provider_used")?,
            created_at: row.get("created_at")?,
            scheduled_at: row.get("scheduled_at")?,
            started_at: row.get("started_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Identity of a job touched by a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: String,
    pub action: String,
    pub batch_id: Option<String>,
}

/// A job found in `processing` past the lease deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckJob {
    pub job: JobRef,
    /// True when the job had no attempts left and was failed instead of requeued.
    pub exhausted: bool,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub action: Option<String>,
    pub batch_id: Option<String>,
    pub provider_used: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

fn guard(changed: usize, id: &str, expected: &'static str) -> Result<(), DatabaseError> {
    if changed == 0 {
        return Err(DatabaseError::InvalidTransition {
            id: id.to_string(),
            expected,
        });
    }
    Ok(())
}

pub(super) fn insert_in(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, action, payload, status, priority, attempts, last_error,
         error_kind, batch_id, artifact_id, provider_used, created_at, scheduled_at,
         started_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            job.id,
            job.action,
            job.payload,
            job.status,
            job.priority,
            job.attempts,
            job.last_error,
            job.error_kind,
            job.batch_id,
            job.artifact_id,
            job.provider_used,
            job.created_at,
            job.scheduled_at,
            job.started_at,
            job.updated_at,
            job.completed_at,
        ],
    )?;
    Ok(())
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, job))
}

/// Completes a processing parent job and inserts the jobs it expanded
/// into, atomically: either both happen or neither does.
pub fn expand(
    db: &Database,
    parent_id: &str,
    claimed_at: &str,
    children: &[JobRow],
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status = 'completed', last_error = NULL, error_kind = NULL,
             updated_at = ?2, completed_at = ?2
             WHERE id = ?1 AND status = 'processing' AND started_at = ?3",
            params![parent_id, now, claimed_at],
        )?;
        guard(changed, parent_id, "processing")?;
        for child in children {
            insert_in(&tx, child)?;
        }
        tx.commit()?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Pending jobs whose `scheduled_at` has passed, highest priority first,
/// then oldest first.
pub fn list_eligible(db: &Database, now: &str, limit: u64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![now, limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Moves a pending job to `processing` and counts the attempt.
///
/// Returns `None` when the job is no longer pending (claimed elsewhere or
/// cancelled in the meantime).
pub fn claim(db: &Database, id: &str, now: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'processing', attempts = attempts + 1,
             started_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        find_in(conn, id)
    })
}

/// True while the job is `processing` under the claim made at `claimed_at`.
pub fn is_claimed(db: &Database, id: &str, claimed_at: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found = conn
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1 AND status = 'processing' AND started_at = ?2",
                params![id, claimed_at],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    })
}

/// Marks a processing job completed and records the artifact it produced.
pub fn complete(
    db: &Database,
    id: &str,
    claimed_at: &str,
    artifact_id: Option<&str>,
    provider_used: Option<&str>,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'completed', artifact_id = ?2, provider_used = ?3,
             last_error = NULL, error_kind = NULL, updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND status = 'processing' AND started_at = ?5",
            params![id, artifact_id, provider_used, now, claimed_at],
        )?;
        guard(changed, id, "processing")
    })
}

/// Returns a processing job to `pending` with a future `scheduled_at`.
pub fn schedule_retry(
    db: &Database,
    id: &str,
    claimed_at: &str,
    scheduled_at: &str,
    error: &str,
    error_kind: &str,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'pending', scheduled_at = ?2, last_error = ?3,
             error_kind = ?4, started_at = NULL, updated_at = ?5
             WHERE id = ?1 AND status = 'processing' AND started_at = ?6",
            params![id, scheduled_at, error, error_kind, now, claimed_at],
        )?;
        guard(changed, id, "processing")
    })
}

/// Permanently fails a processing job.
///
/// `attempts` overrides the stored counter; used when a failure must not
/// consume an attempt.
pub fn fail(
    db: &Database,
    id: &str,
    claimed_at: &str,
    error: &str,
    error_kind: &str,
    attempts: Option<i64>,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', last_error = ?2, error_kind = ?3,
             attempts = COALESCE(?4, attempts), updated_at = ?5, completed_at = ?5
             WHERE id = ?1 AND status = 'processing' AND started_at = ?6",
            params![id, error, error_kind, attempts, now, claimed_at],
        )?;
        guard(changed, id, "processing")
    })
}

/// Updates only the status (and optionally the error) of a job that is
/// currently in `expected`.
pub fn update_status(
    db: &Database,
    id: &str,
    expected: &'static str,
    status: &str,
    error: Option<&str>,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, last_error = COALESCE(?4, last_error), updated_at = ?5
             WHERE id = ?1 AND status = ?2",
            params![id, expected, status, error, now],
        )?;
        guard(changed, id, expected)
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref action) = filter.action {
            conditions.push(format!("action = ?{}", param_values.len() + 1));
            param_values.push(Box::new(action.clone()));
        }
        if let Some(ref batch_id) = filter.batch_id {
            conditions.push(format!("batch_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(batch_id.clone()));
        }
        if let Some(ref provider) = filter.provider_used {
            conditions.push(format!("provider_used = ?{}", param_values.len() + 1));
            param_values.push(Box::new(provider.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, rowid DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Counts all jobs.
pub fn count_all(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?;
        Ok(count)
    })
}

/// Counts pending jobs that already used at least one attempt.
pub fn count_retrying(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending' AND attempts > 0",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Requeues jobs stuck in `processing` since before `cutoff`.
///
/// Jobs that already used `max_attempts` are failed with kind `stuck`
/// because they may not be scheduled again.
pub fn reset_stuck(
    db: &Database,
    cutoff: &str,
    max_attempts: i64,
    now: &str,
) -> Result<Vec<StuckJob>, DatabaseError> {
    db.with_conn(|conn| {
        let stuck: Vec<(JobRef, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT id, action, batch_id, attempts FROM jobs
                 WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?1)",
            )?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((
                        JobRef {
                            id: row.get(0)?,
                            action: row.get(1)?,
                            batch_id: row.get(2)?,
                        },
                        row.get(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut recovered = Vec::with_capacity(stuck.len());
        for (job, attempts) in stuck {
            let exhausted = attempts >= max_attempts;
            let changed = if exhausted {
                conn.execute(
                    "UPDATE jobs SET status = 'failed', error_kind = 'stuck',
                     last_error = 'stuck in processing past the lease TTL with no attempts left',
                     updated_at = ?2, completed_at = ?2
                     WHERE id = ?1 AND status = 'processing'",
                    params![job.id, now],
                )?
            } else {
                conn.execute(
                    "UPDATE jobs SET status = 'pending', error_kind = 'stuck',
                     last_error = 'recovered after lease expiry',
                     started_at = NULL, scheduled_at = ?2, updated_at = ?2
                     WHERE id = ?1 AND status = 'processing'",
                    params![job.id, now],
                )?
            };
            if changed > 0 {
                recovered.push(StuckJob { job, exhausted });
            }
        }
        Ok(recovered)
    })
}

/// Cancels every pending job of a batch. Returns the number cancelled.
pub fn cancel_pending_in_batch(
    db: &Database,
    batch_id: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?2, completed_at = ?2
             WHERE batch_id = ?1 AND status = 'pending'",
            params![batch_id, now],
        )?;
        Ok(changed)
    })
}

/// Puts failed jobs (optionally only those of one batch) back to `pending`
/// with a fresh attempt budget. Returns the jobs that were reset.
pub fn reset_failed(
    db: &Database,
    batch_id: Option<&str>,
    now: &str,
) -> Result<Vec<JobRef>, DatabaseError> {
    db.with_conn(|conn| {
        let failed: Vec<JobRef> = {
            let mut stmt = conn.prepare(
                "SELECT id, action, batch_id FROM jobs
                 WHERE status = 'failed' AND (?1 IS NULL OR batch_id = ?1)",
            )?;
            let rows = stmt
                .query_map(params![batch_id], |row| {
                    Ok(JobRef {
                        id: row.get(0)?,
                        action: row.get(1)?,
                        batch_id: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut reset = Vec::with_capacity(failed.len());
        for job in failed {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'pending', attempts = 0, last_error = NULL,
                 error_kind = NULL, started_at = NULL, completed_at = NULL,
                 scheduled_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'failed'",
                params![job.id, now],
            )?;
            if changed > 0 {
                reset.push(job);
            }
        }
        Ok(reset)
    })
}

/// Deletes all completed jobs. Returns the number deleted.
pub fn delete_completed(db: &Database) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute("DELETE FROM jobs WHERE status = 'completed'", [])?;
        Ok(deleted)
    })
}
