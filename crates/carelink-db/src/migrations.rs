//! Schema migrations.
//!
//! The schema version is SQLite's `user_version`: migration `n` (1-based)
//! has run once `user_version >= n`. Each step and its version bump commit
//! together.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

/// Schema steps in order. Append only; never edit a released step.
const MIGRATIONS: &[&str] = &[
    include_str!("migrations/001_chats.sql"),
    include_str!("migrations/002_messages.sql"),
    include_str!("migrations/003_notifications.sql"),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("cannot read schema version: {0}")]
    Version(#[source] rusqlite::Error),

    #[error("migration to schema version {version} failed: {source}")]
    Step {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    /// The file was migrated by a newer build.
    #[error("database schema version {found} is newer than the latest known version {latest}")]
    NewerSchema { found: u32, latest: u32 },
}

/// Brings the schema up to date and returns how many steps ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    upgrade(conn, MIGRATIONS)
}

/// Current schema version; 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<u32, MigrationError> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(MigrationError::Version)
}

fn upgrade(conn: &Connection, steps: &[&str]) -> Result<usize, MigrationError> {
    let latest = steps.len() as u32;
    let found = schema_version(conn)?;
    if found > latest {
        return Err(MigrationError::NewerSchema { found, latest });
    }

    let mut applied = 0;
    for (version, sql) in (1..=latest).zip(steps).skip(found as usize) {
        let failed = |source| MigrationError::Step { version, source };

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(failed)?;
        // Another process may have run this step while we waited for the lock.
        if schema_version(&tx)? >= version {
            continue;
        }
        tx.execute_batch(sql).map_err(failed)?;
        tx.pragma_update(None, "user_version", version).map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::info!(version, "schema migrated");
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn fresh_db_reaches_latest_version() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        assert_eq!(schema_version(&conn).unwrap(), 0);

        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(schema_version(&conn).unwrap() as usize, MIGRATIONS.len());

        for table in ["chats", "participants", "messages", "notifications"] {
            assert!(table_exists(&conn, table), "{table} table should exist");
        }
    }

    #[test]
    fn second_run_is_a_no_op() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("first run should succeed");
        assert_eq!(run_migrations(&conn).expect("second run should succeed"), 0);
    }

    #[test]
    fn only_new_steps_run_on_an_older_schema() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        assert_eq!(upgrade(&conn, &MIGRATIONS[..2]).unwrap(), 2);
        assert!(!table_exists(&conn, "notifications"));

        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert!(table_exists(&conn, "notifications"));
    }

    #[test]
    fn failed_step_keeps_previous_version() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let steps = [
            "CREATE TABLE kept (id INTEGER PRIMARY KEY);",
            "CREATE TABLE half_done (id INTEGER PRIMARY KEY);
             INSERT INTO table_that_does_not_exist VALUES (1);",
        ];

        match upgrade(&conn, &steps) {
            Err(MigrationError::Step { version, .. }) => assert_eq!(version, 2),
            other => panic!("expected a failed step, got {other:?}"),
        }
        assert_eq!(schema_version(&conn).unwrap(), 1);
        assert!(table_exists(&conn, "kept"));
        assert!(!table_exists(&conn, "half_done"));
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(MigrationError::NewerSchema { found: 99, .. })
        ));
    }

    #[test]
    fn participant_roles_are_constrained() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");
        conn.execute("INSERT INTO chats (id) VALUES ('c1')", [])
            .expect("should insert chat");

        let bad = conn.execute(
            "INSERT INTO participants (chat_id, user_id, user_type) VALUES ('c1', 'u1', 'admin')",
            [],
        );
        assert!(bad.is_err(), "unknown user_type must be rejected");
    }
}
