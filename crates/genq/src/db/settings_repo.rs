//! Key/value queue settings (pause flag, last processed timestamp).

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

pub const PAUSED: &str = "paused";
pub const LAST_PROCESSED_AT: &str = "last_processed_at";

/// Reads a setting.
pub fn get(db: &Database, key: &str) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        let value = conn
            .query_row(
                "SELECT value FROM queue_settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    })
}

/// Writes a setting, replacing any previous value.
pub fn set(db: &Database, key: &str, value: &str, now: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO queue_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    })
}

/// Reads a boolean setting; anything other than `"true"` is false.
pub fn get_flag(db: &Database, key: &str) -> Result<bool, DatabaseError> {
    Ok(get(db, key)?.as_deref() == Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2026-01-01T00:00:00.000000Z";

    #[test]
    fn test_get_set() {
        let db = Database::open_in_memory().unwrap();
        assert!(get(&db, PAUSED).unwrap().is_none());
        assert!(!get_flag(&db, PAUSED).unwrap());

        set(&db, PAUSED, "true", NOW).unwrap();
        assert!(get_flag(&db, PAUSED).unwrap());

        set(&db, PAUSED, "false", NOW).unwrap();
        assert_eq!(get(&db, PAUSED).unwrap().as_deref(), Some("false"));
        assert!(!get_flag(&db, PAUSED).unwrap());
    }
}
