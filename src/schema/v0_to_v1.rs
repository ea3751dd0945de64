use log::info;
use rusqlite::Connection;

use super::add_column_if_missing;
use crate::error::CoursePulseError;

/// Schema Upgrade: Version 0 → 1
///
/// Adds the nullable `hash` column holding the content fingerprint of generated
/// description/html records.
pub fn migrate_0_to_1(conn: &Connection) -> Result<(), CoursePulseError> {
    if add_column_if_missing(conn, "files", "hash", "TEXT NULL")? {
        info!("Migration 0→1: added files.hash");
    }
    Ok(())
}
