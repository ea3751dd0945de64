use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoursePulseError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into CoursePulseError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Logging error: {0}")]
    LoggingError(#[from] flexi_logger::FlexiLoggerError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },

    #[error("Schema migration to version {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: Box<CoursePulseError>,
    },

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl CoursePulseError {
    /// True when the database reported SQLITE_BUSY or SQLITE_LOCKED after the busy timeout
    /// expired. Callers may retry the whole operation.
    pub fn is_busy(&self) -> bool {
        match self {
            CoursePulseError::DatabaseError(RusqliteError::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            CoursePulseError::Migration { source, .. } => source.is_busy(),
            _ => false,
        }
    }
}

impl From<figment::Error> for CoursePulseError {
    fn from(err: figment::Error) -> Self {
        CoursePulseError::ConfigError(Box::new(err))
    }
}
