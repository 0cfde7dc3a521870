//! Batch repository.
//!
//! Counter updates are single guarded statements: an outcome is only
//! counted while `completed_items + failed_items < total_items`, and the
//! status flips to `completed` in the same statement that records the last
//! item.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::job_repo::{self, JobRow};
use super::{Database, DatabaseError};

/// A raw batch row from the database.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: String,
    pub total_items: i64,
    pub completed_items: i64,
    pub failed_items: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl BatchRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            total_items: row.get("total_items")?,
            completed_items: row.get("completed_items")?,
            failed_items: row.get("failed_items")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Which counter an item outcome increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed,
}

fn insert_in(conn: &Connection, id: &str, total_items: i64, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO batches (id, total_items, completed_items, failed_items, status,
         created_at, updated_at)
         VALUES (?1, ?2, 0, 0, 'processing', ?3, ?3)",
        params![id, total_items, now],
    )?;
    Ok(())
}

/// Inserts a new batch in `processing` with zeroed counters.
pub fn insert(db: &Database, id: &str, total_items: i64, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, id, total_items, now))
}

/// Inserts a batch together with the jobs that belong to it. Either all
/// rows are written or none are.
pub fn insert_with_jobs(
    db: &Database,
    id: &str,
    total_items: i64,
    jobs: &[JobRow],
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        insert_in(&tx, id, total_items, now)?;
        for job in jobs {
            job_repo::insert_in(&tx, job)?;
        }
        tx.commit()?;
        Ok(())
    })
}

/// Finds a batch by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<BatchRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM batches WHERE id = ?1",
                params![id],
                BatchRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Counts one finished item. Returns `false` when the batch was already
/// full (or does not exist) and nothing changed.
pub fn record_outcome(
    db: &Database,
    id: &str,
    outcome: ItemOutcome,
    now: &str,
) -> Result<bool, DatabaseError> {
    let (done, failed) = match outcome {
        ItemOutcome::Completed => (1, 0),
        ItemOutcome::Failed => (0, 1),
    };
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE batches SET
                completed_items = completed_items + ?2,
                failed_items = failed_items + ?3,
                status = CASE
                    WHEN status = 'processing'
                         AND completed_items + failed_items + 1 >= total_items
                    THEN 'completed'
                    ELSE status
                END,
                updated_at = ?4
             WHERE id = ?1 AND completed_items + failed_items < total_items",
            params![id, done, failed, now],
        )?;
        Ok(changed > 0)
    })
}

/// Marks every item that has not finished yet as failed and completes the
/// batch. Returns the number of items counted.
pub fn fail_remaining(db: &Database, id: &str, now: &str) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        let remaining: Option<i64> = conn
            .query_row(
                "SELECT total_items - completed_items - failed_items FROM batches WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(remaining) = remaining.filter(|n| *n > 0) else {
            return Ok(0);
        };
        conn.execute(
            "UPDATE batches SET failed_items = failed_items + ?2,
             status = CASE WHEN status = 'processing' THEN 'completed' ELSE status END,
             updated_at = ?3
             WHERE id = ?1",
            params![id, remaining, now],
        )?;
        Ok(remaining)
    })
}

/// Sets a batch to `cancelled` unless it already completed.
pub fn mark_cancelled(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE batches SET status = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// Un-counts `count` failed items after they were put back to pending.
/// The status is left as it is.
pub fn decrement_failed(
    db: &Database,
    id: &str,
    count: i64,
    now: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE batches SET failed_items = MAX(failed_items - ?2, 0), updated_at = ?3
             WHERE id = ?1",
            params![id, count, now],
        )?;
        Ok(())
    })
}

/// Shrinks the batch by one item that will never run. Completes the batch
/// when every remaining item has finished.
pub fn remove_item(db: &Database, id: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE batches SET total_items = total_items - 1,
             status = CASE
                 WHEN status = 'processing'
                      AND completed_items + failed_items >= total_items - 1
                 THEN 'completed'
                 ELSE status
             END,
             updated_at = ?2
             WHERE id = ?1 AND total_items > completed_items + failed_items",
            params![id, now],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2026-01-01T00:00:00.000000Z";

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, "b1", 3, NOW).unwrap();
        let batch = find_by_id(&db, "b1").unwrap().unwrap();
        assert_eq!(batch.total_items, 3);
        assert_eq!(batch.completed_items, 0);
        assert_eq!(batch.status, "processing");
        assert!(find_by_id(&db, "missing").unwrap().is_none());
    }

    fn batch_job(batch_id: &str) -> JobRow {
        use crate::queue::job::{JobAction, NewJob};
        use chrono::{TimeZone, Utc};

        NewJob::new(JobAction::GenerateContent, serde_json::json!({ "topic": "rust" }))
            .batch(batch_id)
            .into_row(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_insert_with_jobs() {
        let db = test_db();
        let jobs = vec![batch_job("b1"), batch_job("b1")];
        insert_with_jobs(&db, "b1", 2, &jobs, NOW).unwrap();
        assert_eq!(find_by_id(&db, "b1").unwrap().unwrap().total_items, 2);
        assert_eq!(job_repo::count_all(&db).unwrap(), 2);
    }

    #[test]
    fn test_failed_job_insert_leaves_no_batch_behind() {
        let db = test_db();
        let job = batch_job("b1");
        // Same id twice: the second insert fails.
        let jobs = vec![job.clone(), job];
        assert!(insert_with_jobs(&db, "b1", 2, &jobs, NOW).is_err());
        assert!(find_by_id(&db, "b1").unwrap().is_none());
        assert_eq!(job_repo::count_all(&db).unwrap(), 0);
    }

    #[test]
    fn test_record_outcome_completes_on_last_item() {
        let db = test_db();
        insert(&db, "b1", 3, NOW).unwrap();

        assert!(record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap());
        assert!(record_outcome(&db, "b1", ItemOutcome::Failed, NOW).unwrap());
        assert_eq!(find_by_id(&db, "b1").unwrap().unwrap().status, "processing");

        assert!(record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap());
        let batch = find_by_id(&db, "b1").unwrap().unwrap();
        assert_eq!(batch.completed_items, 2);
        assert_eq!(batch.failed_items, 1);
        assert_eq!(batch.status, "completed");
    }

    #[test]
    fn test_record_outcome_never_overcounts() {
        let db = test_db();
        insert(&db, "b1", 1, NOW).unwrap();
        assert!(record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap());
        assert!(!record_outcome(&db, "b1", ItemOutcome::Failed, NOW).unwrap());

        let batch = find_by_id(&db, "b1").unwrap().unwrap();
        assert_eq!(batch.completed_items, 1);
        assert_eq!(batch.failed_items, 0);
    }

    #[test]
    fn test_fail_remaining() {
        let db = test_db();
        insert(&db, "b1", 4, NOW).unwrap();
        record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap();

        assert_eq!(fail_remaining(&db, "b1", NOW).unwrap(), 3);
        let batch = find_by_id(&db, "b1").unwrap().unwrap();
        assert_eq!(batch.failed_items, 3);
        assert_eq!(batch.status, "completed");
        assert_eq!(fail_remaining(&db, "b1", NOW).unwrap(), 0);
    }

    #[test]
    fn test_cancel_does_not_touch_completed() {
        let db = test_db();
        insert(&db, "b1", 1, NOW).unwrap();
        record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap();
        assert!(!mark_cancelled(&db, "b1", NOW).unwrap());

        insert(&db, "b2", 2, NOW).unwrap();
        assert!(mark_cancelled(&db, "b2", NOW).unwrap());
        assert_eq!(find_by_id(&db, "b2").unwrap().unwrap().status, "cancelled");
    }

    #[test]
    fn test_decrement_failed_keeps_status() {
        let db = test_db();
        insert(&db, "b1", 2, NOW).unwrap();
        record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap();
        record_outcome(&db, "b1", ItemOutcome::Failed, NOW).unwrap();

        decrement_failed(&db, "b1", 1, NOW).unwrap();
        let batch = find_by_id(&db, "b1").unwrap().unwrap();
        assert_eq!(batch.failed_items, 0);
        assert_eq!(batch.status, "completed");

        decrement_failed(&db, "b1", 5, NOW).unwrap();
        assert_eq!(find_by_id(&db, "b1").unwrap().unwrap().failed_items, 0);
    }

    #[test]
    fn test_remove_item_can_complete_batch() {
        let db = test_db();
        insert(&db, "b1", 2, NOW).unwrap();
        record_outcome(&db, "b1", ItemOutcome::Completed, NOW).unwrap();

        remove_item(&db, "b1", NOW).unwrap();
        let batch = find_by_id(&db, "b1").unwrap().unwrap();
        assert_eq!(batch.total_items, 1);
        assert_eq!(batch.status, "completed");
    }
}
