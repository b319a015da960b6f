//! Durable store for projects, context snapshots, and worker instances.
//!
//! SQLite behind an r2d2 pool. File databases run in WAL mode so readers
//! never wait on a writer that has committed; writes that assign sequence
//! numbers take the write lock up front (`BEGIN IMMEDIATE`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{ContextError, ContextResult};

mod instances;
mod projects;
pub mod schema;
mod snapshots;

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pool sizing and acquisition limits.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub pool_size: u32,
    /// Upper bound on waiting for a pooled connection or a SQLite lock.
    pub acquire_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to the context store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (or create) a file-backed store. Call [`Database::migrate`] before use.
    pub fn open(path: &Path, options: &DatabaseOptions) -> ContextResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pragmas = schema::connection_pragmas(options.acquire_timeout.as_millis());
        let manager =
            SqliteConnectionManager::file(path).with_init(move |conn| conn.execute_batch(&pragmas));
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .connection_timeout(options.acquire_timeout)
            .build(manager)?;

        debug!(?path, pool_size = options.pool_size, "database opened");
        Ok(Self { pool })
    }

    /// Open the store at the platform data directory.
    pub fn open_default() -> ContextResult<Self> {
        Self::open(&Self::default_path()?, &DatabaseOptions::default())
    }

    pub fn default_path() -> ContextResult<PathBuf> {
        ProjectDirs::from("", "", "strata")
            .map(|dirs| dirs.data_dir().join("context.db"))
            .ok_or_else(|| ContextError::store("could not determine a data directory"))
    }

    /// Create an in-memory store with the schema applied (for tests and demos).
    ///
    /// Every SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn open_memory() -> ContextResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// Apply the schema unless the `projects` table already exists.
    pub fn migrate(&self) -> ContextResult<()> {
        self.with_connection(|conn| {
            let present: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master
                 WHERE type = 'table' AND name = 'projects')",
                [],
                |row| row.get(0),
            )?;
            if present {
                debug!("schema already present");
                return Ok(());
            }
            conn.execute_batch(schema::SCHEMA)?;
            info!("context store schema created");
            Ok(())
        })
    }

    /// Run `f` with a pooled connection; the connection returns to the pool on
    /// every exit path.
    pub fn with_connection<T, F>(&self, f: F) -> ContextResult<T>
    where
        F: FnOnce(&mut Connection) -> ContextResult<T>,
    {
        let mut conn = self.pool.get()?;
        f(&mut *conn)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.pool.state();
        f.debug_struct("Database")
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC so that string order is
/// time order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn invalid_text(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn migrate_is_idempotent() {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        db.migrate().unwrap();

        let tables: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                     AND name IN ('projects', 'context_snapshots', 'active_instances')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn file_database_uses_wal() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("ctx.db"), &DatabaseOptions::default()).unwrap();
        db.migrate().unwrap();

        let mode: String = db
            .with_connection(|conn| {
                Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("ctx.db");
        let db = Database::open(&path, &DatabaseOptions::default()).unwrap();
        db.migrate().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn schema_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ctx.db");
        {
            let db = Database::open(&path, &DatabaseOptions::default()).unwrap();
            db.migrate().unwrap();
            db.create_project(&crate::models::CreateProjectInput::new("kept").with_id("p1"))
                .unwrap();
        }
        let db = Database::open(&path, &DatabaseOptions::default()).unwrap();
        db.migrate().unwrap();
        assert!(db.project_exists("p1").unwrap());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1500);
        assert!(timestamp(earlier) < timestamp(later));
        let parsed = parse_timestamp(0, &timestamp(earlier)).unwrap();
        assert_eq!(parsed.timestamp_micros(), earlier.timestamp_micros());
    }
}
