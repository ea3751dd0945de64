use log::info;
use rusqlite::Connection;

use super::add_column_if_missing;
use crate::error::CoursePulseError;

/// Schema Upgrade: Version 1 → 2
///
/// Adds the `moved` lifecycle flag.
pub fn migrate_1_to_2(conn: &Connection) -> Result<(), CoursePulseError> {
    if add_column_if_missing(conn, "files", "moved", "INTEGER DEFAULT 0 NOT NULL")? {
        info!("Migration 1→2: added files.moved");
    }
    Ok(())
}
