use log::debug;
use rusqlite::{named_params, params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::CoursePulseError;
use crate::file_record::{CourseSnapshot, DownloadStatus, FileRecord};
use crate::files::{group_by_course, text_lossy, Files, FILE_COLUMNS};
use crate::utils::Utils;

pub const DEFAULT_FAILURE_REASON_MAX_LEN: usize = 500;

/// Per-course failure statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub course_id: i64,
    pub course_fullname: String,
    pub failed_count: i64,
    pub total_failures: i64,
    pub max_consecutive: i64,
    pub earliest_failure: i64,
    pub latest_failure: i64,
}

/// Download outcome bookkeeping.
///
/// Rows are addressed by `(course_id, module_id, content_fileurl)` because the downloader may
/// report a failure before the file has a `file_id`.
pub struct Outcomes;

impl Outcomes {
    /// Record a failed download attempt.
    ///
    /// Updates the newest current-truth row for the key, or inserts a failed row if the store
    /// has never seen the file. Either way the failure becomes an unreported change.
    pub fn record_failure(
        db: &Database,
        file: &FileRecord,
        course_id: i64,
        course_fullname: &str,
        reason: &str,
        reason_max_len: usize,
    ) -> Result<(), CoursePulseError> {
        let reason = Utils::opt_truncate(Some(reason), reason_max_len);
        let conn = db.get_connection()?;

        Database::immediate_transaction(&conn, |c| {
            let now = Utils::now_secs();
            let existing: Option<i64> = c
                .query_row(
                    "SELECT file_id FROM files
                     WHERE course_id = ? AND module_id = ? AND content_fileurl = ?
                     ORDER BY deleted, modified, moved, file_id DESC
                     LIMIT 1",
                    params![course_id, file.module_id, file.content_fileurl],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(file_id) => {
                    c.execute(
                        "UPDATE files
                         SET download_status = :status,
                             download_attempts = COALESCE(download_attempts, 0) + 1,
                             last_download_at = :now,
                             last_failed_at = :now,
                             last_failed_reason = :reason,
                             consecutive_failures = COALESCE(consecutive_failures, 0) + 1,
                             saved_to = CASE WHEN :saved_to = '' THEN saved_to ELSE :saved_to END,
                             notified = 0
                         WHERE file_id = :file_id",
                        named_params! {
                            ":status":   DownloadStatus::Failed.as_ref(),
                            ":now":      now,
                            ":reason":   reason,
                            ":saved_to": file.saved_to,
                            ":file_id":  file_id,
                        },
                    )?;
                    debug!(
                        "Recorded failure for '{}' (file_id {})",
                        file.content_filename, file_id
                    );
                }
                None => {
                    c.execute(
                        "INSERT INTO files (
                                course_id, course_fullname, module_id, section_id, section_name,
                                module_name, module_modname, content_filepath, content_filename,
                                position_in_section, content_fileurl, content_filesize,
                                content_timemodified, content_type, content_isexternalfile, hash,
                                saved_to, time_stamp, modified, moved, deleted, notified,
                                download_status, download_attempts, last_download_at,
                                last_failed_at, last_failed_reason, consecutive_failures
                            ) VALUES (
                                :course_id, :course_fullname, :module_id, :section_id, :section_name,
                                :module_name, :module_modname, :content_filepath, :content_filename,
                                :position_in_section, :content_fileurl, :content_filesize,
                                :content_timemodified, :content_type, :content_isexternalfile, :hash,
                                :saved_to, :now, 0, 0, 0, 0,
                                :status, 1, :now, :now, :reason, 1
                            )",
                        named_params! {
                            ":course_id":              course_id,
                            ":course_fullname":        course_fullname,
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
                            ":now":                    now,
                            ":reason":                 reason,
                            ":status":                 DownloadStatus::Failed.as_ref(),
                        },
                    )?;
                    debug!("Inserted failed row for unseen '{}'", file.content_filename);
                }
            }
            Ok(())
        })
    }

    /// Record a successful download. Ends the failure streak but keeps the lifetime attempt
    /// counter. Returns the number of rows updated.
    pub fn record_success(
        db: &Database,
        file: &FileRecord,
        course_id: i64,
    ) -> Result<usize, CoursePulseError> {
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let updated = c.execute(
                "UPDATE files
                 SET download_status = ?,
                     last_download_at = ?,
                     consecutive_failures = 0,
                     last_failed_reason = NULL
                 WHERE course_id = ? AND module_id = ? AND content_fileurl = ?",
                params![
                    DownloadStatus::Success.as_ref(),
                    Utils::now_secs(),
                    course_id,
                    file.module_id,
                    file.content_fileurl
                ],
            )?;
            Ok(updated)
        })
    }

    /// Failed rows with at least `min_consecutive_failures`, worst offenders first. Files
    /// removed from the course are left out.
    pub fn list_failures(
        db: &Database,
        course_id: Option<i64>,
        min_consecutive_failures: i64,
    ) -> Result<Vec<FileRecord>, CoursePulseError> {
        let conn = db.get_connection()?;
        Files::query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE download_status = 'failed'
                   AND deleted = 0
                   AND consecutive_failures >= :min
                   AND (:course_id IS NULL OR course_id = :course_id)
                 ORDER BY consecutive_failures DESC, last_failed_at DESC, file_id"
            ),
            named_params! {
                ":min":       min_consecutive_failures,
                ":course_id": course_id,
            },
        )
    }

    /// Same rows as `list_failures` without a course filter, grouped by course.
    pub fn list_failures_by_course(
        db: &Database,
        min_consecutive_failures: i64,
    ) -> Result<Vec<CourseSnapshot>, CoursePulseError> {
        let conn = db.get_connection()?;
        let files = Files::query_files(
            &conn,
            &format!(
                "SELECT {FILE_COLUMNS} FROM files
                 WHERE download_status = 'failed'
                   AND deleted = 0
                   AND consecutive_failures >= ?
                 ORDER BY course_id, consecutive_failures DESC, last_failed_at DESC, file_id"
            ),
            params![min_consecutive_failures],
        )?;
        Ok(group_by_course(files))
    }

    pub fn failure_summary(db: &Database) -> Result<Vec<FailureSummary>, CoursePulseError> {
        let conn = db.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT course_id,
                    MAX(course_fullname),
                    COUNT(*) AS failed_count,
                    COALESCE(SUM(consecutive_failures), 0),
                    COALESCE(MAX(consecutive_failures), 0),
                    COALESCE(MIN(last_failed_at), 0),
                    COALESCE(MAX(last_failed_at), 0)
             FROM files
             WHERE download_status = 'failed' AND deleted = 0
             GROUP BY course_id
             ORDER BY failed_count DESC, course_id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(FailureSummary {
                course_id: row.get(0)?,
                course_fullname: text_lossy(row.get_ref(1)?),
                failed_count: row.get(2)?,
                total_failures: row.get(3)?,
                max_consecutive: row.get(4)?,
                earliest_failure: row.get(5)?,
                latest_failure: row.get(6)?,
            })
        })?;

        let summary = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(summary)
    }

    /// Put a failed file back in the queue. `download_attempts` is preserved.
    pub fn reset_for_retry(
        db: &Database,
        file: &FileRecord,
        course_id: i64,
    ) -> Result<usize, CoursePulseError> {
        let conn = db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            let updated = c.execute(
                "UPDATE files
                 SET download_status = ?,
                     consecutive_failures = 0,
                     last_failed_reason = NULL
                 WHERE course_id = ? AND module_id = ? AND content_fileurl = ?",
                params![
                    DownloadStatus::Pending.as_ref(),
                    course_id,
                    file.module_id,
                    file.content_fileurl
                ],
            )?;
            debug!("Reset '{}' for retry ({} rows)", file.content_filename, updated);
            Ok(updated)
        })
    }
}
