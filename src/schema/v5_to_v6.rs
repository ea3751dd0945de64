use log::info;
use rusqlite::Connection;

use crate::error::CoursePulseError;

/// Schema Upgrade: Version 5 → 6
///
/// Version 6 introduced session/cookie tables that this engine does not use. The step keeps
/// version numbers aligned with databases that already went through it and leaves any such
/// tables untouched.
pub fn migrate_5_to_6(_conn: &Connection) -> Result<(), CoursePulseError> {
    info!("Migration 5→6: no changes to files");
    Ok(())
}
