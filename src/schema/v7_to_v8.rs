use log::info;
use rusqlite::Connection;

use super::add_column_if_missing;
use crate::error::CoursePulseError;

pub const UPGRADE_7_TO_8_POST_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_position_in_section
ON files (course_id, section_id, position_in_section);
"#;

/// Schema Upgrade: Version 7 → 8
///
/// Adds the nullable `position_in_section` ordinal. Existing rows stay NULL until the next
/// run re-assigns ordinals.
pub fn migrate_7_to_8(conn: &Connection) -> Result<(), CoursePulseError> {
    if add_column_if_missing(conn, "files", "position_in_section", "INTEGER")? {
        info!("Migration 7→8: added files.position_in_section");
    }
    Ok(())
}
