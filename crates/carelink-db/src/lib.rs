//! Database layer for CareLink.
//!
//! A pooled SQLite database in WAL mode plus the schema migrations for the
//! chat store in `carelink-chat`. The schema is compiled into the binary
//! and brought up to date on startup.

mod migrations;
mod pool;

pub use migrations::{run_migrations, schema_version, MigrationError};
pub use pool::{create_pool, DbPool, PoolError, PoolSettings};
