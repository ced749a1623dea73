//! Database connection pool management.
//!
//! File-backed pools run in WAL mode so readers never wait on the single
//! writer. The in-memory pool holds exactly one connection, since every
//! `:memory:` connection is a separate database.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use galleryd_common::{Error, Result};
use std::path::Path;

use crate::migrations;

/// Type alias for the database connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Type alias for a pooled database connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Open (creating if needed) the database at `db_path`, verify it and run
/// pending migrations.
///
/// A failed integrity check is reported as [`Error::StoreCorruption`].
///
/// # Example
///
/// ```no_run
/// use galleryd_db::pool::init_pool;
///
/// let pool = init_pool("/var/lib/galleryd/galleryd.db").unwrap();
/// let conn = pool.get().unwrap();
/// ```
pub fn init_pool<P: AsRef<Path>>(db_path: P) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path.as_ref()).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::database(format!("Failed to create connection pool: {}", e)))?;

    prepare(&pool)?;
    Ok(pool)
}

/// Initialize an in-memory database pool for testing.
///
/// # Example
///
/// ```
/// use galleryd_db::pool::init_memory_pool;
///
/// let pool = init_memory_pool().unwrap();
/// let conn = pool.get().unwrap();
/// ```
pub fn init_memory_pool() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();

    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::database(format!("Failed to create in-memory pool: {}", e)))?;

    prepare(&pool)?;
    Ok(pool)
}

fn prepare(pool: &DbPool) -> Result<()> {
    let conn = get_conn(pool)?;
    check_integrity(&conn)?;
    migrations::run_migrations(&conn)
        .map_err(|e| Error::database(format!("Failed to run migrations: {}", e)))?;
    Ok(())
}

/// Run `PRAGMA quick_check` and fail with [`Error::StoreCorruption`] unless it
/// reports `ok`.
pub fn check_integrity(conn: &rusqlite::Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::NotADatabase
                    || code.code == rusqlite::ErrorCode::DatabaseCorrupt =>
            {
                Error::corruption(e.to_string())
            }
            other => Error::database(other.to_string()),
        })?;
    if verdict != "ok" {
        return Err(Error::corruption(format!("integrity check failed: {verdict}")));
    }
    Ok(())
}

/// Get a connection from the pool.
pub fn get_conn(pool: &DbPool) -> Result<PooledConnection> {
    pool.get()
        .map_err(|e| Error::database(format!("Failed to get connection from pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_memory_pool() {
        let pool = init_memory_pool().unwrap();
        assert_eq!(pool.max_size(), 1);
    }

    #[test]
    fn test_migrations_run_on_init() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='registrations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_memory_pool_keeps_data_between_checkouts() {
        let pool = init_memory_pool().unwrap();
        {
            let conn = get_conn(&pool).unwrap();
            conn.execute(
                "INSERT INTO registrations (filename, source, discovered_at, fingerprint, updated_at)
                 VALUES ('a.png', 'watched', 't', 'ff', 't')",
                [],
            )
            .unwrap();
        }

        let conn = get_conn(&pool).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM registrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_file_pool_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(dir.path().join("galleryd.db")).unwrap();
        let conn = get_conn(&pool).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
