//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order. ADD COLUMN migrations are skipped when the
//! column already exists so the runner stays idempotent.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_batches_table",
        sql: include_str!("sql/002_create_batches.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_run_leases_table",
        sql: include_str!("sql/003_create_run_leases.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "create_queue_settings_table",
        sql: include_str!("sql/004_create_queue_settings.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 5,
        description: "add_provider_used_to_jobs",
        sql: include_str!("sql/005_add_provider_used.sql"),
        kind: MigrationKind::AddColumn {
            table: "jobs",
            column: "provider_used",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (column already present)",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_column_exists_check() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE test_tbl (id TEXT, name TEXT);")
            .unwrap();

        assert!(column_exists(&conn, "test_tbl", "id").unwrap());
        assert!(!column_exists(&conn, "test_tbl", "missing").unwrap());
    }

    #[test]
    fn test_add_column_skipped_when_present() {
        let conn = Connection::open_in_memory().unwrap();
        // Simulate a database created before migration tracking existed.
        conn.execute_batch(include_str!("sql/001_create_jobs.sql"))
            .unwrap();
        conn.execute_batch(include_str!("sql/005_add_provider_used.sql"))
            .unwrap();

        run_all(&conn).unwrap();
        assert!(column_exists(&conn, "jobs", "provider_used").unwrap());
    }

    #[test]
    fn test_batches_reject_overcounting() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO batches (id, total_items, completed_items, failed_items, created_at, updated_at)
             VALUES ('b1', 1, 1, 1, '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(result.is_err());
    }
}
