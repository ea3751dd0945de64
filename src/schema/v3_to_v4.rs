use log::info;
use rusqlite::Connection;

use super::column_exists;
use crate::error::CoursePulseError;

/// Schema Upgrade: Version 3 → 4
///
/// Introduces store-assigned identity (`file_id`) and the version chain (`old_file_id`).
///
/// SQLite cannot add a primary key to an existing table, so following
/// https://www.sqlite.org/lang_altertable.html we:
/// 1. Create the new layout as `new_files`.
/// 2. Copy the old contents into `new_files` (ids are assigned in rowid order).
/// 3. Drop the original `files`.
/// 4. Rename `new_files` to `files` and recreate its indexes.
pub const UPGRADE_3_TO_4_SQL: &str = r#"
CREATE TABLE new_files (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    course_id integer NOT NULL,
    course_fullname integer NOT NULL,
    module_id integer NOT NULL,
    section_name text NOT NULL,
    module_name text NOT NULL,
    content_filepath text NOT NULL,
    content_filename text NOT NULL,
    content_fileurl text NOT NULL,
    content_filesize integer NOT NULL,
    content_timemodified integer NOT NULL,
    module_modname text NOT NULL,
    content_type text NOT NULL,
    content_isexternalfile text NOT NULL,
    saved_to text NOT NULL,
    hash text NULL,
    time_stamp integer NOT NULL,
    old_file_id integer NULL,
    modified integer DEFAULT 0 NOT NULL,
    moved integer DEFAULT 0 NOT NULL,
    deleted integer DEFAULT 0 NOT NULL,
    notified integer DEFAULT 0 NOT NULL
);

INSERT INTO new_files (
    course_id, course_fullname, module_id, section_name,
    module_name, content_filepath, content_filename,
    content_fileurl, content_filesize, content_timemodified,
    module_modname, content_type, content_isexternalfile,
    saved_to, hash, time_stamp, modified, moved, deleted, notified
)
SELECT
    course_id, course_fullname, module_id, section_name,
    module_name, content_filepath, content_filename,
    content_fileurl, content_filesize, content_timemodified,
    module_modname, content_type, content_isexternalfile,
    saved_to, hash, time_stamp, modified, moved, deleted, notified
FROM files
ORDER BY rowid;

DROP TABLE files;

ALTER TABLE new_files RENAME TO files;

CREATE INDEX IF NOT EXISTS idx_module_id ON files (module_id);
CREATE INDEX IF NOT EXISTS idx_course_id ON files (course_id);
"#;

/// Rebuilds the table unless a previous attempt already produced the new layout.
pub fn migrate_3_to_4(conn: &Connection) -> Result<(), CoursePulseError> {
    if column_exists(conn, "files", "file_id")? {
        info!("Migration 3→4: files.file_id already present, skipping rebuild");
        return Ok(());
    }

    conn.execute_batch(UPGRADE_3_TO_4_SQL)?;

    let row_count: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
    info!("Migration 3→4: rebuilt files with file_id ({} rows)", row_count);
    Ok(())
}
