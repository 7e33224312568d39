//! SQLite connection pool shared by the REST handlers and the message store.

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;

/// How the pool opens connections and hands them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// How long a statement waits for another writer's lock before
    /// failing with `SQLITE_BUSY`.
    pub busy_timeout: Duration,
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// How long `pool.get()` waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot switch {path} to WAL journaling: {source}")]
    Journal {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot open connection pool for {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: r2d2::Error,
    },
}

/// Per-connection state. `journal_mode` belongs to the database file and
/// is set once in [`create_pool`]; everything here resets with each
/// connection.
#[derive(Debug)]
struct ConnectionPragmas {
    busy_timeout: Duration,
}

impl CustomizeConnection<Connection, rusqlite::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        // Durable at every WAL checkpoint, which is enough for chat history.
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }
}

/// Opens a pool over the database at `path`.
///
/// `:memory:` gets a single shared connection, since every new connection
/// to an in-memory database would otherwise see its own empty schema.
pub fn create_pool(path: &str, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let builder = Pool::builder()
        .connection_timeout(settings.acquire_timeout)
        .connection_customizer(Box::new(ConnectionPragmas {
            busy_timeout: settings.busy_timeout,
        }));

    let (builder, manager) = if path == ":memory:" {
        // The database lives as long as its one connection does.
        let builder = builder.max_size(1).idle_timeout(None).max_lifetime(None);
        (builder, SqliteConnectionManager::memory())
    } else {
        enable_wal(path)?;
        let builder = builder.max_size(settings.max_connections.max(1));
        (builder, SqliteConnectionManager::file(path))
    };

    builder
        .build(manager)
        .map_err(|source| PoolError::Open {
            path: path.to_string(),
            source,
        })
}

fn enable_wal(path: &str) -> Result<(), PoolError> {
    let journal = |source| PoolError::Journal {
        path: path.to_string(),
        source,
    };
    let conn = Connection::open(path).map_err(journal)?;
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(journal)?;
    tracing::debug!(path, journal_mode = %mode, "database opened");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pragma<T: rusqlite::types::FromSql>(conn: &Connection, name: &str) -> T {
        conn.pragma_query_value(None, name, |row| row.get(0))
            .expect("should read pragma")
    }

    #[test]
    fn file_connections_get_wal_and_session_pragmas() {
        let file = tempfile::NamedTempFile::new().expect("should create temp file");
        let path = file.path().to_str().expect("temp path is utf-8").to_string();
        let settings = PoolSettings {
            busy_timeout: Duration::from_millis(1_500),
            max_connections: 2,
            ..PoolSettings::default()
        };

        let pool = create_pool(&path, settings).expect("pool creation should succeed");
        assert_eq!(pool.max_size(), 2);

        let conn = pool.get().expect("should get a connection");
        assert_eq!(pragma::<String>(&conn, "journal_mode"), "wal");
        assert_eq!(pragma::<i64>(&conn, "foreign_keys"), 1);
        assert_eq!(pragma::<i64>(&conn, "busy_timeout"), 1_500);
        // NORMAL
        assert_eq!(pragma::<i64>(&conn, "synchronous"), 1);
    }

    #[test]
    fn memory_pool_shares_one_database() {
        let pool = create_pool(":memory:", PoolSettings::default()).expect("pool should open");
        assert_eq!(pool.max_size(), 1);

        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();
        let x: i64 = pool
            .get()
            .unwrap()
            .query_row("SELECT x FROM t", [], |row| row.get(0))
            .expect("second checkout sees the same database");
        assert_eq!(x, 7);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let file = tempfile::NamedTempFile::new().expect("should create temp file");
        let path = file.path().to_str().expect("temp path is utf-8").to_string();
        let pool = create_pool(
            &path,
            PoolSettings {
                max_connections: 1,
                acquire_timeout: Duration::from_millis(50),
                ..PoolSettings::default()
            },
        )
        .expect("pool should open");

        let _held = pool.get().expect("first checkout");
        assert!(pool.get().is_err());
    }
}
