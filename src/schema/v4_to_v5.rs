use log::info;
use rusqlite::Connection;

use super::add_column_if_missing;
use crate::error::CoursePulseError;

/// Schema Upgrade: Version 4 → 5
///
/// Adds `section_id`. Existing rows get section 0.
pub fn migrate_4_to_5(conn: &Connection) -> Result<(), CoursePulseError> {
    if add_column_if_missing(conn, "files", "section_id", "INTEGER DEFAULT 0 NOT NULL")? {
        info!("Migration 4→5: added files.section_id");
    }
    Ok(())
}
