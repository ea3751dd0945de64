use std::collections::BTreeMap;

use log::{debug, info, warn};
use rusqlite::types::ValueRef;
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::comparator::{ChangeKind, ChangeSet, FileChange};
use crate::database::Database;
use crate::error::CoursePulseError;
use crate::file_record::{CourseSnapshot, DownloadStatus, FileRecord, TYPE_DESCRIPTION, TYPE_HTML};
use crate::utils::Utils;

/// Column list shared by every query that materializes a `FileRecord`. Order matches
/// `Files::from_row`.
pub(crate) const FILE_COLUMNS: &str = "file_id, old_file_id, course_id, course_fullname,
    module_id, section_id, section_name, module_name, module_modname,
    content_filepath, content_filename, position_in_section,
    content_fileurl, content_filesize, content_timemodified, content_type,
    content_isexternalfile, hash, saved_to, time_stamp,
    modified, moved, deleted, notified,
    download_status, download_attempts, last_download_at, last_failed_at,
    last_failed_reason, consecutive_failures";

/// Predicate selecting the rows that make up the stored snapshot.
pub(crate) const CURRENT_TRUTH: &str = "deleted = 0 AND modified = 0 AND moved = 0";

/// An unreported record. Superseded (modified/moved) records carry the row that replaced them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyEntry {
    pub file: FileRecord,
    pub new_file: Option<FileRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyCourse {
    pub course_id: i64,
    pub course_fullname: String,
    pub entries: Vec<NotifyEntry>,
}

/// Latest known modification time per module for the kinds that are fetched incrementally.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTimestamps {
    pub forum: BTreeMap<i64, i64>,
    pub calendar: BTreeMap<i64, i64>,
}

/// Read/write access to the `files` table.
///
/// Every write runs in its own immediate transaction on its own pooled connection; callers
/// compose batches out of individually committed calls.
pub struct Files;

impl Files {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<FileRecord> {
        let download_status: Option<String> = row.get(24)?;

        Ok(FileRecord {
            file_id: row.get(0)?,
            // Databases created by older releases default the column to 0
            old_file_id: row.get::<_, Option<i64>>(1)?.filter(|id| *id != 0),
            course_id: row.get(2)?,
            course_fullname: text_lossy(row.get_ref(3)?),
            module_id: row.get(4)?,
            section_id: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
            section_name: row.get(6)?,
            module_name: row.get(7)?,
            module_modname: row.get(8)?,
            content_filepath: row.get(9)?,
            content_filename: row.get(10)?,
            position_in_section: row.get(11)?,
            content_fileurl: row.get(12)?,
            content_filesize: row.get::<_, Option<i64>>(13)?.unwrap_or(0),
            content_timemodified: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
            content_type: row.get(15)?,
            content_isexternalfile: flag_lossy(row.get_ref(16)?),
            hash: row.get(17)?,
            saved_to: row.get(18)?,
            time_stamp: row.get::<_, Option<i64>>(19)?.unwrap_or(0),
            modified: flag_lossy(row.get_ref(20)?),
            moved: flag_lossy(row.get_ref(21)?),
            deleted: flag_lossy(row.get_ref(22)?),
            notified: flag_lossy(row.get_ref(23)?),
            download_status: DownloadStatus::from_db(download_status.as_deref()),
            download_attempts: row.get::<_, Option<i64>>(25)?.unwrap_or(0),
            last_download_at: row.get::<_, Option<i64>>(26)?.unwrap_or(0),
            last_failed_at: row.get::<_, Option<i64>>(27)?.unwrap_or(0),
            last_failed_reason: row.get(28)?,
            consecutive_failures: row.get::<_, Option<i64>>(29)?.unwrap_or(0),
        })
    }

    pub(crate) fn query_files<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<FileRecord>, CoursePulseError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::from_row)?;
        let files = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn get_by_id(db: &Database, file_id: i64) -> Result<Option<FileRecord>, CoursePulseError> {
        let conn = db.get_connection()?;
        conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = ?"),
            params![file_id],
            Self::from_row,
        )
        .optional()
        .map_err(CoursePulseError::DatabaseError)
    }

    /// The stored snapshot: one `CourseSnapshot` per course among the current-truth rows.
    pub fn get_current_snapshot(db: &Database) -> Result<Vec<CourseSnapshot>, CoursePulseError> {
        let conn = db.get_connection()?;
        let files = Self::query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE {CURRENT_TRUTH}
                 ORDER BY course_id, file_id"
            ),
            [],
        )?;

        let courses = group_by_course(files);
        debug!("Loaded stored snapshot: {} courses", courses.len());
        Ok(courses)
    }

    /// Record a file seen for the first time. Returns the assigned `file_id`.
    pub fn insert_new(
        db: &Database,
        course_id: i64,
        course_fullname: &str,
        file: &FileRecord,
    ) -> Result<i64, CoursePulseError> {
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let mut row = prepare_insert(file, course_id, course_fullname);
            row.old_file_id = None;
            row.notified = false;
            insert_row(c, &row)
        })
    }

    /// Record a modified or moved file.
    ///
    /// The new row is inserted already notified, linked to the old row via `old_file_id`. The
    /// old row gets the `modified`/`moved` flag and `notified = 0`, so it is the single record
    /// that reports the change. Returns the new row's `file_id`.
    pub fn supersede(
        db: &Database,
        course_id: i64,
        course_fullname: &str,
        change: &FileChange,
    ) -> Result<i64, CoursePulseError> {
        let old_file_id = match change.old_file.as_ref().and_then(|old| old.file_id) {
            Some(id) => id,
            None => {
                warn!(
                    "{} change for '{}' has no stored original; recording it as new",
                    change.kind, change.file.content_filename
                );
                return Self::insert_new(db, course_id, course_fullname, &change.file);
            }
        };

        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let mut row = prepare_insert(&change.file, course_id, course_fullname);
            row.old_file_id = Some(old_file_id);
            row.notified = true;
            let new_file_id = insert_row(c, &row)?;

            let now = Utils::now_secs();
            let updated = match change.kind {
                ChangeKind::Modified => {
                    // The old copy may have been renamed on disk by the downloader
                    let saved_to = change
                        .old_file
                        .as_ref()
                        .map(|old| old.saved_to.as_str())
                        .unwrap_or_default();
                    c.execute(
                        "UPDATE files
                         SET notified = 0, modified = 1, time_stamp = ?, saved_to = ?
                         WHERE file_id = ?",
                        params![now, saved_to, old_file_id],
                    )?
                }
                ChangeKind::Moved => c.execute(
                    "UPDATE files
                     SET notified = 0, moved = 1, time_stamp = ?
                     WHERE file_id = ?",
                    params![now, old_file_id],
                )?,
                ChangeKind::New | ChangeKind::Deleted => {
                    return Err(CoursePulseError::Error(format!(
                        "Cannot supersede with a '{}' change",
                        change.kind
                    )))
                }
            };

            if updated == 0 {
                return Err(CoursePulseError::Error(format!(
                    "Superseded file_id {} does not exist",
                    old_file_id
                )));
            }

            Ok(new_file_id)
        })
    }

    /// Flag a stored record as deleted. The row itself is kept.
    pub fn mark_deleted(db: &Database, file: &FileRecord) -> Result<(), CoursePulseError> {
        let file_id = require_id(file)?;
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let updated = c.execute(
                "UPDATE files SET notified = 0, deleted = 1, time_stamp = ? WHERE file_id = ?",
                params![Utils::now_secs(), file_id],
            )?;
            if updated == 0 {
                return Err(CoursePulseError::Error(format!(
                    "Deleted file_id {} does not exist",
                    file_id
                )));
            }
            Ok(())
        })
    }

    /// Persist one classified change. Returns the new `file_id` for additions and supersedes.
    pub fn save_change(
        db: &Database,
        course_id: i64,
        course_fullname: &str,
        change: &FileChange,
    ) -> Result<Option<i64>, CoursePulseError> {
        match change.kind {
            ChangeKind::New => {
                Self::insert_new(db, course_id, course_fullname, &change.file).map(Some)
            }
            ChangeKind::Modified | ChangeKind::Moved => {
                Self::supersede(db, course_id, course_fullname, change).map(Some)
            }
            ChangeKind::Deleted => Self::mark_deleted(db, &change.file).map(|_| None),
        }
    }

    /// Persist every change of `changes`, one committed write per change. Stops at the first
    /// storage error; everything written before it stays committed.
    pub fn apply_change_set(db: &Database, changes: &ChangeSet) -> Result<usize, CoursePulseError> {
        let mut written = 0;
        for (course, change) in changes.iter_changes() {
            Self::save_change(db, course.course_id, &course.course_fullname, change)?;
            written += 1;
        }
        info!("Persisted {} changes", written);
        Ok(written)
    }

    /// Flag all deleted entries of `changes` in a single transaction.
    pub fn mark_deleted_batch(db: &Database, changes: &ChangeSet) -> Result<usize, CoursePulseError> {
        let file_ids = changes
            .iter_changes()
            .filter(|(_, change)| change.kind == ChangeKind::Deleted)
            .map(|(_, change)| require_id(&change.file))
            .collect::<Result<Vec<_>, _>>()?;

        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let now = Utils::now_secs();
            let mut stmt = c.prepare(
                "UPDATE files SET notified = 0, deleted = 1, time_stamp = ? WHERE file_id = ?",
            )?;
            let mut marked = 0;
            for file_id in &file_ids {
                marked += stmt.execute(params![now, file_id])?;
            }
            Ok(marked)
        })
    }

    /// Every record with `notified = 0`, grouped by course.
    pub fn list_unnotified(db: &Database) -> Result<Vec<NotifyCourse>, CoursePulseError> {
        let conn = db.get_connection()?;
        let files = Self::query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE notified = 0
                 ORDER BY course_id, file_id"
            ),
            [],
        )?;

        let mut new_file_stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE old_file_id = ?
             ORDER BY file_id DESC
             LIMIT 1"
        ))?;

        let mut courses: Vec<NotifyCourse> = Vec::new();
        for file in files {
            let new_file = match (file.modified || file.moved, file.file_id) {
                (true, Some(file_id)) => new_file_stmt
                    .query_row(params![file_id], Self::from_row)
                    .optional()?,
                _ => None,
            };

            let entry = NotifyEntry { file, new_file };
            match courses.last_mut() {
                Some(course) if course.course_id == entry.file.course_id => {
                    course.entries.push(entry)
                }
                _ => courses.push(NotifyCourse {
                    course_id: entry.file.course_id,
                    course_fullname: entry.file.course_fullname.clone(),
                    entries: vec![entry],
                }),
            }
        }

        Ok(courses)
    }

    /// Mark records as reported. Records without a `file_id` are skipped.
    pub fn mark_notified(db: &Database, files: &[FileRecord]) -> Result<usize, CoursePulseError> {
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let mut stmt = c.prepare("UPDATE files SET notified = 1 WHERE file_id = ?")?;
            let mut marked = 0;
            for file_id in files.iter().filter_map(|f| f.file_id) {
                marked += stmt.execute(params![file_id])?;
            }
            Ok(marked)
        })
    }

    /// Superseded rows still referenced by a newer version, grouped by course.
    pub fn get_old_versions(db: &Database) -> Result<Vec<CourseSnapshot>, CoursePulseError> {
        let conn = db.get_connection()?;
        let files = Self::query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE file_id IN (
                     SELECT old_file_id FROM files
                     WHERE old_file_id IS NOT NULL AND old_file_id != 0
                 )
                 ORDER BY course_id, file_id"
            ),
            [],
        )?;
        Ok(group_by_course(files))
    }

    /// Hard-delete rows, unlinking any version chain that points at them. Returns the number of
    /// rows removed.
    pub fn prune(db: &Database, file_ids: &[i64]) -> Result<usize, CoursePulseError> {
        let conn = db.get_connection()?;
        let removed = Database::immediate_transaction(&conn, |c| {
            let mut removed = 0;
            for file_id in file_ids {
                c.execute(
                    "UPDATE files SET old_file_id = NULL WHERE old_file_id = ?",
                    params![file_id],
                )?;
                removed += c.execute("DELETE FROM files WHERE file_id = ?", params![file_id])?;
            }
            Ok(removed)
        })?;
        info!("Pruned {} of {} requested rows", removed, file_ids.len());
        Ok(removed)
    }

    pub fn last_timestamp_per_module(db: &Database) -> Result<ModuleTimestamps, CoursePulseError> {
        let conn = db.get_connection()?;
        Ok(ModuleTimestamps {
            forum: max_time_per_module(&conn, "forum", TYPE_DESCRIPTION)?,
            calendar: max_time_per_module(&conn, "calendar", TYPE_HTML)?,
        })
    }
}

fn max_time_per_module(
    conn: &Connection,
    modname: &str,
    content_type: &str,
) -> Result<BTreeMap<i64, i64>, CoursePulseError> {
    let mut stmt = conn.prepare(
        "SELECT module_id, MAX(content_timemodified)
         FROM files
         WHERE module_modname = ? AND content_type = ?
         GROUP BY module_id",
    )?;
    let rows = stmt.query_map(params![modname, content_type], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    let map = rows.collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(map)
}

fn require_id(file: &FileRecord) -> Result<i64, CoursePulseError> {
    file.file_id.ok_or_else(|| {
        CoursePulseError::Error(format!(
            "File '{}' has no file_id",
            file.content_filename
        ))
    })
}

/// Normalize a record about to be written as a fresh current-truth row.
fn prepare_insert(file: &FileRecord, course_id: i64, course_fullname: &str) -> FileRecord {
    let mut row = file.clone();
    row.file_id = None;
    row.course_id = course_id;
    row.course_fullname = course_fullname.to_owned();
    row.time_stamp = Utils::now_secs();
    row.modified = false;
    row.moved = false;
    row.deleted = false;
    row
}

fn insert_row(conn: &Connection, file: &FileRecord) -> Result<i64, CoursePulseError> {
    conn.execute(
        "INSERT INTO files (
            old_file_id, course_id, course_fullname, module_id, section_id, section_name,
            module_name, module_modname, content_filepath, content_filename,
            position_in_section, content_fileurl, content_filesize, content_timemodified,
            content_type, content_isexternalfile, hash, saved_to, time_stamp,
            modified, moved, deleted, notified,
            download_status, download_attempts, last_download_at, last_failed_at,
            last_failed_reason, consecutive_failures
        ) VALUES (
            :old_file_id, :course_id, :course_fullname, :module_id, :section_id, :section_name,
            :module_name, :module_modname, :content_filepath, :content_filename,
            :position_in_section, :content_fileurl, :content_filesize, :content_timemodified,
            :content_type, :content_isexternalfile, :hash, :saved_to, :time_stamp,
            :modified, :moved, :deleted, :notified,
            :download_status, :download_attempts, :last_download_at, :last_failed_at,
            :last_failed_reason, :consecutive_failures
        )",
        named_params! {
            ":old_file_id":            file.old_file_id,
            ":course_id":              file.course_id,
            ":course_fullname":        file.course_fullname,
            ":module_id":              file.module_id,
            ":section_id":             file.section_id,
            ":section_name":           file.section_name,
            ":module_name":            file.module_name,
            ":module_modname":         file.module_modname,
            ":content_filepath":       file.content_filepath,
            ":content_filename":       file.content_filename,
            ":position_in_section":    file.position_in_section,
            ":content_fileurl":        file.content_fileurl,
            ":content_filesize":       file.content_filesize,
            ":content_timemodified":   file.content_timemodified,
            ":content_type":           file.content_type,
            ":content_isexternalfile": file.content_isexternalfile,
            ":hash":                   file.hash,
            ":saved_to":               file.saved_to,
            ":time_stamp":             file.time_stamp,
            ":modified":               file.modified,
            ":moved":                  file.moved,
            ":deleted":                file.deleted,
            ":notified":               file.notified,
            ":download_status":        file.download_status.as_ref(),
            ":download_attempts":      file.download_attempts,
            ":last_download_at":       file.last_download_at,
            ":last_failed_at":         file.last_failed_at,
            ":last_failed_reason":     file.last_failed_reason,
            ":consecutive_failures":   file.consecutive_failures,
        },
    )?;
    Ok(conn.last_insert_rowid())
}

/// Group rows already ordered by course into snapshots.
pub(crate) fn group_by_course(files: Vec<FileRecord>) -> Vec<CourseSnapshot> {
    let mut courses: Vec<CourseSnapshot> = Vec::new();
    for file in files {
        match courses.last_mut() {
            Some(course) if course.course_id == file.course_id => course.files.push(file),
            _ => {
                let mut course = CourseSnapshot::new(file.course_id, &file.course_fullname);
                course.files.push(file);
                courses.push(course);
            }
        }
    }
    courses
}

/// Early databases declared `course_fullname` as an integer column.
pub(crate) fn text_lossy(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Null => String::new(),
    }
}

/// Flags written as text ("1", "True") by early releases.
fn flag_lossy(value: ValueRef<'_>) -> bool {
    match value {
        ValueRef::Integer(i) => i != 0,
        ValueRef::Real(f) => f != 0.0,
        ValueRef::Text(bytes) => {
            let s = String::from_utf8_lossy(bytes);
            s == "1" || s.eq_ignore_ascii_case("true")
        }
        ValueRef::Blob(_) | ValueRef::Null => false,
    }
}
