use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::CoursePulseError;
use crate::schema;

pub const DB_FILENAME: &str = "moodle_state.db";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DatabaseOptions {
    /// How long a connection waits on a locked database before reporting SQLITE_BUSY.
    pub busy_timeout_ms: u64,
    pub pool_size: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        DatabaseOptions {
            busy_timeout_ms: 5000,
            pool_size: 4,
        }
    }
}

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the state database. Clones share the connection pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("pool_size", &self.pool.max_size())
            .finish()
    }
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema to the latest version.
    pub fn open(path: &Path, options: &DatabaseOptions) -> Result<Self, CoursePulseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = Duration::from_millis(options.busy_timeout_ms);
        let manager = SqliteConnectionManager::file(path).with_init(move |c| {
            c.busy_timeout(busy_timeout)?;
            c.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .build(manager)?;

        let db = Database {
            pool,
            path: path.to_path_buf(),
        };

        let conn = db.get_connection()?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Database journal mode: {}", journal_mode);

        schema::migrate(&conn)?;
        info!("Database opened at: {}", db.path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, CoursePulseError> {
        Ok(self.pool.get()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<i64, CoursePulseError> {
        let conn = self.get_connection()?;
        schema::schema_version(&conn)
    }

    /// Run `f` inside `BEGIN IMMEDIATE ... COMMIT`. The write lock is taken up front so a
    /// concurrent writer fails at BEGIN (after the busy timeout) rather than mid-way through.
    /// Any error from `f` rolls the transaction back and is returned unchanged.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, CoursePulseError>
    where
        F: FnOnce(&Connection) -> Result<T, CoursePulseError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        error!("Rollback after failed commit also failed: {}", rollback_err);
                    }
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

/// Fresh database in a temporary directory. Keep the `TempDir` alive for the test's duration.
#[cfg(test)]
pub(crate) fn open_temp_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open(&dir.path().join(DB_FILENAME), &DatabaseOptions::default()).unwrap();
    (dir, db)
}
