pub mod migration;
pub mod schema;

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::config::DatabaseConfig;
use crate::error::MapMarkError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// How long to wait for a pooled connection before giving up.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Owned handle to the marker database. Cloning is cheap: every clone shares
/// the same bounded connection pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Opens (creating if needed) the database file described by `config` and
    /// brings its schema to the current version. Any failure here is fatal to
    /// startup: the server must not run against a partially migrated schema.
    pub fn open(config: &DatabaseConfig) -> Result<Self, MapMarkError> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        if let Some(parent) = Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", true)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_open_conns)
            .min_idle(Some(config.max_idle_conns))
            .max_lifetime(Some(Duration::from_secs(config.conn_max_lifetime)))
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)?;

        info!("Database opened at: {}", config.path);

        let db = Self { pool };
        db.ensure_schema()?;

        Ok(db)
    }

    /// Checks out a pooled connection. The connection goes back to the pool
    /// when dropped.
    pub fn conn(&self) -> Result<DbConnection, MapMarkError> {
        Ok(self.pool.get()?)
    }

    /// Runs `f` inside an IMMEDIATE transaction. The transaction commits when
    /// `f` returns `Ok` and rolls back on `Err` (or on panic, via drop).
    pub fn immediate_transaction<T, F>(conn: &mut Connection, f: F) -> Result<T, MapMarkError>
    where
        F: FnOnce(&Transaction) -> Result<T, MapMarkError>,
    {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn ensure_schema(&self) -> Result<(), MapMarkError> {
        let mut conn = self.conn()?;
        migration::ensure_schema(&mut conn)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_connections_enforce_foreign_keys() {
        let test_db = open_test_db();
        let conn = test_db.db.conn().unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_image_without_marker_is_rejected() {
        let test_db = open_test_db();
        let conn = test_db.db.conn().unwrap();
        let result = conn.execute(
            "INSERT INTO images (marker_id, filename) VALUES (?, ?)",
            rusqlite::params![999, "orphan.png"],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let test_db = open_test_db();
        let mut conn = test_db.db.conn().unwrap();

        let result: Result<(), MapMarkError> = Database::immediate_transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO markers (latitude, longitude) VALUES (1.0, 2.0)",
                [],
            )?;
            Err(MapMarkError::Error("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM markers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig {
            path: dir
                .path()
                .join("data/nested/markers.db")
                .to_string_lossy()
                .into_owned(),
            max_open_conns: 2,
            max_idle_conns: 1,
            ..DatabaseConfig::default()
        };

        Database::open(&config).unwrap();
        assert!(dir.path().join("data/nested/markers.db").exists());
    }

    #[test]
    fn test_reopen_existing_database() {
        let test_db = open_test_db();
        {
            let conn = test_db.db.conn().unwrap();
            conn.execute(
                "INSERT INTO markers (latitude, longitude) VALUES (1.0, 2.0)",
                [],
            )
            .unwrap();
        }

        let reopened = Database::open(&test_config(&test_db.dir)).unwrap();
        let count: i64 = reopened
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM markers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
