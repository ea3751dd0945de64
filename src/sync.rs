use log::{error, info, Level};
use logging_timer::timer;
use serde::{Deserialize, Serialize};

use crate::comparator::{ChangeSet, StateComparator, SyncPolicy};
use crate::database::Database;
use crate::error::CoursePulseError;
use crate::file_record::{CourseSnapshot, FileRecord};
use crate::files::Files;
use crate::outcomes::{Outcomes, DEFAULT_FAILURE_REASON_MAX_LEN};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DownloadResult {
    Success,
    Failed { reason: String },
}

/// What the download executor reports for one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub course_id: i64,
    pub course_fullname: String,
    pub file: FileRecord,
    pub result: DownloadResult,
}

impl DownloadOutcome {
    pub fn success(course: &CourseSnapshot, file: &FileRecord) -> Self {
        DownloadOutcome {
            course_id: course.course_id,
            course_fullname: course.course_fullname.clone(),
            file: file.clone(),
            result: DownloadResult::Success,
        }
    }

    pub fn failed(course: &CourseSnapshot, file: &FileRecord, reason: &str) -> Self {
        DownloadOutcome {
            course_id: course.course_id,
            course_fullname: course.course_fullname.clone(),
            file: file.clone(),
            result: DownloadResult::Failed {
                reason: reason.to_owned(),
            },
        }
    }
}

/// An outcome that could not be written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub course_id: i64,
    pub module_id: i64,
    pub content_fileurl: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeReport {
    pub recorded: usize,
    pub errors: Vec<OutcomeError>,
}

impl OutcomeReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs one synchronization pass: stored snapshot → comparison → persisted change set.
pub struct SyncEngine {
    db: Database,
    comparator: StateComparator,
    failure_reason_max_len: usize,
}

impl SyncEngine {
    pub fn new(db: Database, policy: SyncPolicy) -> Self {
        SyncEngine {
            db,
            comparator: StateComparator::new(policy),
            failure_reason_max_len: DEFAULT_FAILURE_REASON_MAX_LEN,
        }
    }

    pub fn with_failure_reason_max_len(mut self, max_len: usize) -> Self {
        self.failure_reason_max_len = max_len;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Classify `current` against the stored snapshot without writing anything.
    pub fn plan(&self, current: &[CourseSnapshot]) -> Result<ChangeSet, CoursePulseError> {
        let stored = Files::get_current_snapshot(&self.db)?;
        Ok(self.comparator.compare(&stored, current))
    }

    /// Classify and persist. Storage errors abort the pass; changes written before the error
    /// stay committed and the next run picks up from there.
    pub fn run(&self, current: &[CourseSnapshot]) -> Result<ChangeSet, CoursePulseError> {
        let _tmr = timer!(Level::Debug; "SyncEngine::run", "{} courses", current.len());

        let changes = self.plan(current)?;
        if changes.is_empty() {
            info!("No changes found");
            return Ok(changes);
        }

        Files::apply_change_set(&self.db, &changes)?;

        let counts = changes.counts();
        info!(
            "Sync complete: {} new, {} modified, {} moved, {} deleted",
            counts.new_count, counts.modified_count, counts.moved_count, counts.deleted_count
        );
        Ok(changes)
    }

    /// Apply download outcomes one by one. A failed write is logged and reported per file
    /// without stopping the batch.
    pub fn record_outcomes(&self, outcomes: &[DownloadOutcome]) -> OutcomeReport {
        let mut report = OutcomeReport::default();

        for outcome in outcomes {
            let result = match &outcome.result {
                DownloadResult::Success => {
                    Outcomes::record_success(&self.db, &outcome.file, outcome.course_id).map(|_| ())
                }
                DownloadResult::Failed { reason } => Outcomes::record_failure(
                    &self.db,
                    &outcome.file,
                    outcome.course_id,
                    &outcome.course_fullname,
                    reason,
                    self.failure_reason_max_len,
                ),
            };

            match result {
                Ok(()) => report.recorded += 1,
                Err(e) => {
                    error!(
                        "Failed to record download outcome for '{}': {}",
                        outcome.file.content_filename, e
                    );
                    report.errors.push(OutcomeError {
                        course_id: outcome.course_id,
                        module_id: outcome.file.module_id,
                        content_fileurl: outcome.file.content_fileurl.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::ChangeKind;
    use crate::database::open_temp_db;
    use crate::file_record::{test_file, DownloadStatus};
    use crate::outcomes::Outcomes;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn course_of(files: Vec<FileRecord>) -> CourseSnapshot {
        CourseSnapshot {
            course_id: 101,
            course_fullname: "Test Course".to_string(),
            files,
        }
    }

    #[test]
    fn test_resized_file_is_modified_end_to_end() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        engine
            .run(&[course_of(vec![test_file(5, "/", "a.pdf", "U1", 100, 1000)])])
            .unwrap();

        let changes = engine
            .run(&[course_of(vec![test_file(5, "/", "a.pdf", "U1", 200, 2000)])])
            .unwrap();

        assert_eq!(changes.len(), 1);
        let (_, change) = changes.iter_changes().next().unwrap();
        assert_eq!(change.kind, ChangeKind::Modified);
        let old_file = change.old_file.as_ref().unwrap();
        assert_eq!(old_file.content_filesize, 100);
        assert!(old_file.file_id.is_some());
    }

    #[test]
    fn test_missing_course_end_to_end() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        engine
            .run(&[course_of(vec![test_file(5, "/", "a.pdf", "U1", 100, 1000)])])
            .unwrap();

        let changes = engine.run(&[]).unwrap();
        let counts = changes.counts();
        assert_eq!(counts.deleted_count, 1);
        assert_eq!(counts.new_count, 0);
        assert!(Files::get_current_snapshot(engine.database()).unwrap().is_empty());
    }

    #[test]
    fn test_second_run_is_empty() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        let current = vec![course_of(vec![
            test_file(5, "/", "a.pdf", "U1", 100, 1000),
            test_file(6, "/slides/", "b.pdf", "U2", 300, 1000),
        ])];

        assert_eq!(engine.run(&current).unwrap().counts().new_count, 2);
        assert!(engine.run(&current).unwrap().is_empty());
        assert!(engine.plan(&current).unwrap().is_empty());
    }

    #[test]
    fn test_plan_does_not_write() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        let current = vec![course_of(vec![test_file(5, "/", "a.pdf", "U1", 100, 1000)])];

        assert_eq!(engine.plan(&current).unwrap().len(), 1);
        assert_eq!(engine.plan(&current).unwrap().len(), 1);
    }

    #[test]
    fn test_record_outcomes() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default()).with_failure_reason_max_len(4);
        let course = course_of(vec![
            test_file(5, "/", "a.pdf", "U1", 100, 1000),
            test_file(6, "/", "b.pdf", "U2", 100, 1000),
        ]);
        engine.run(std::slice::from_ref(&course)).unwrap();

        let report = engine.record_outcomes(&[
            DownloadOutcome::success(&course, &course.files[0]),
            DownloadOutcome::failed(&course, &course.files[1], "connection reset"),
        ]);
        assert_eq!(report.recorded, 2);
        assert!(report.is_complete());

        let failures = Outcomes::list_failures(engine.database(), None, 1).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].content_fileurl, "U2");
        assert_eq!(failures[0].last_failed_reason.as_deref(), Some("conn"));

        let stored = Files::get_current_snapshot(engine.database()).unwrap();
        let a = stored[0].files.iter().find(|f| f.content_fileurl == "U1").unwrap();
        assert_eq!(a.download_status, DownloadStatus::Success);
    }

    #[test]
    fn test_failed_outcome_write_does_not_stop_batch() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        let course = course_of(vec![
            test_file(5, "/", "a.pdf", "U1", 100, 1000),
            test_file(6, "/", "b.pdf", "U2", 100, 1000),
            test_file(7, "/", "c.pdf", "U3", 100, 1000),
        ]);
        engine.run(std::slice::from_ref(&course)).unwrap();
        engine
            .database()
            .get_connection()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_u2 BEFORE UPDATE ON files
                 WHEN NEW.content_fileurl = 'U2'
                 BEGIN SELECT RAISE(ABORT, 'write rejected'); END;",
            )
            .unwrap();

        let report = engine.record_outcomes(&[
            DownloadOutcome::failed(&course, &course.files[0], "timeout"),
            DownloadOutcome::failed(&course, &course.files[1], "timeout"),
            DownloadOutcome::success(&course, &course.files[2]),
        ]);

        assert_eq!(report.recorded, 2);
        assert!(!report.is_complete());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].content_fileurl, "U2");
        assert_eq!(report.errors[0].module_id, 6);
        assert!(report.errors[0].error.contains("write rejected"));

        let failures = Outcomes::list_failures(engine.database(), None, 1).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].content_fileurl, "U1");
        let stored = Files::get_current_snapshot(engine.database()).unwrap();
        let c = stored[0].files.iter().find(|f| f.content_fileurl == "U3").unwrap();
        assert_eq!(c.download_status, DownloadStatus::Success);
    }

    #[test]
    fn test_duplicate_paths_settle_after_one_run() {
        let (_dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        let mut plain = test_file(5, "/a/", "b.pdf", "", 0, 1000);
        plain.content_type = "description".to_string();
        let mut hashed = plain.clone();
        hashed.hash = Some("h".to_string());
        let current = vec![course_of(vec![plain, hashed])];

        assert_eq!(engine.run(&current).unwrap().counts().new_count, 2);
        assert!(engine.run(&current).unwrap().is_empty());
    }

    prop_compose! {
        fn arb_listed_file()(
            module_id in 1i64..3,
            path in prop::sample::select(vec!["/", "/a/"]),
            name in prop::sample::select(vec!["a.pdf", "b.pdf"]),
            url in prop::sample::select(vec!["U1", "U2"]),
            size in prop::sample::select(vec![100i64, 200]),
            time in prop::sample::select(vec![1000i64, 2000]),
            modname in prop::sample::select(vec!["resource", "forum"]),
            content_type in prop::sample::select(vec!["file", "description", "html"]),
            hash in prop::sample::select(vec![None, Some("h1")]),
        ) -> FileRecord {
            let mut f = test_file(module_id, path, name, url, size, time);
            f.module_modname = modname.to_string();
            f.content_type = content_type.to_string();
            f.hash = hash.map(str::to_string);
            f
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_repeated_sync_reports_nothing(
            first in prop::collection::vec(arb_listed_file(), 0..5),
            second in prop::collection::vec(arb_listed_file(), 0..5),
        ) {
            let (_dir, db) = open_temp_db();
            let engine = SyncEngine::new(db, SyncPolicy::default());

            engine.run(&[course_of(first)]).unwrap();
            engine.run(&[course_of(second.clone())]).unwrap();
            let again = engine.run(&[course_of(second)]).unwrap();

            prop_assert!(again.is_empty(), "repeated run reported {:?}", again.counts());
        }
    }

    #[test]
    fn test_download_outcome_json_shape() {
        let course = course_of(vec![test_file(5, "/", "a.pdf", "U1", 100, 1000)]);
        let outcome = DownloadOutcome::failed(&course, &course.files[0], "404");

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"]["status"], "failed");
        assert_eq!(json["result"]["reason"], "404");
    }
}
