//! Run leases: a named row that at most one holder owns until it expires.
//!
//! Acquisition is one conditional upsert. A holder whose lease has expired
//! is simply overwritten by the next caller.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// The current owner of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    pub name: String,
    pub holder: String,
    pub acquired_at: String,
    pub expires_at: String,
}

/// Tries to take the lease `name` for `holder` until `expires_at`.
///
/// Returns `true` when the lease was free, expired, or already held by
/// `holder`.
pub fn try_acquire(
    db: &Database,
    name: &str,
    holder: &str,
    now: &str,
    expires_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "INSERT INTO run_leases (name, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE run_leases.expires_at <= excluded.acquired_at
                OR run_leases.holder = excluded.holder",
            params![name, holder, now, expires_at],
        )?;
        Ok(changed == 1)
    })
}

/// Pushes the lease's expiry to `expires_at` if `holder` still owns it.
///
/// Returns `false` when the lease was taken over or released.
pub fn renew(db: &Database, name: &str, holder: &str, expires_at: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE run_leases SET expires_at = ?3 WHERE name = ?1 AND holder = ?2",
            params![name, holder, expires_at],
        )?;
        Ok(changed > 0)
    })
}

/// Releases the lease if `holder` still owns it.
pub fn release(db: &Database, name: &str, holder: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM run_leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(changed > 0)
    })
}

/// Returns the stored lease row, expired or not.
pub fn current(db: &Database, name: &str) -> Result<Option<LeaseRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT name, holder, acquired_at, expires_at FROM run_leases WHERE name = ?1",
                params![name],
                |row| {
                    Ok(LeaseRow {
                        name: row.get(0)?,
                        holder: row.get(1)?,
                        acquired_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    })
}
