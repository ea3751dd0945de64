use log::{info, warn};
use rusqlite::Connection;

use super::add_column_if_missing;
use crate::error::CoursePulseError;

const DOWNLOAD_TRACKING_COLUMNS: [(&str, &str); 6] = [
    ("download_status", "TEXT DEFAULT 'pending'"),
    ("download_attempts", "INTEGER DEFAULT 0"),
    ("last_download_at", "INTEGER DEFAULT 0"),
    ("last_failed_at", "INTEGER DEFAULT 0"),
    ("last_failed_reason", "TEXT"),
    ("consecutive_failures", "INTEGER DEFAULT 0"),
];

/// Rows that are current truth were downloaded by earlier runs.
pub const UPGRADE_6_TO_7_POST_SQL: &str = r#"
UPDATE files
SET download_status = 'success'
WHERE deleted = 0 AND modified = 0 AND moved = 0;

CREATE INDEX IF NOT EXISTS idx_download_status ON files (download_status);
CREATE INDEX IF NOT EXISTS idx_consecutive_failures ON files (consecutive_failures);
"#;

/// Schema Upgrade: Version 6 → 7
///
/// Phase 1 (Rust code):
///   - Adds the download-outcome columns that are not present yet.
///   - Repairs databases that skipped the 1→2 `moved` column.
///
/// Phase 2 (post-SQL):
///   - Marks current rows as successfully downloaded and indexes the failure queries.
pub fn migrate_6_to_7(conn: &Connection) -> Result<(), CoursePulseError> {
    for (column, decl) in DOWNLOAD_TRACKING_COLUMNS {
        add_column_if_missing(conn, "files", column, decl)?;
    }

    if add_column_if_missing(conn, "files", "moved", "INTEGER DEFAULT 0 NOT NULL")? {
        warn!("Migration 6→7: files.moved was missing and has been added");
    }

    info!("Migration 6→7: download outcome tracking columns present");
    Ok(())
}
