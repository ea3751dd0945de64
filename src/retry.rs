use std::collections::HashSet;
use std::process::Command;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::CoursePulseError;
use crate::file_record::{CourseSnapshot, FileRecord};
use crate::outcomes::Outcomes;
use crate::sync::{DownloadOutcome, SyncEngine};

/// Materializes one file. The error string becomes the stored failure reason.
pub trait DownloadExecutor {
    fn download(&self, course: &CourseSnapshot, file: &FileRecord) -> Result<(), String>;
}

/// Runs an external program per file.
///
/// The template is split on whitespace into program and arguments, then `{url}` and
/// `{saved_to}` are substituted inside each argument. No shell is involved, so paths with
/// spaces reach the program as a single argument.
pub struct CommandExecutor {
    template: String,
}

impl CommandExecutor {
    pub fn new(template: &str) -> Self {
        CommandExecutor {
            template: template.to_owned(),
        }
    }

    fn render(&self, file: &FileRecord) -> Vec<String> {
        self.template
            .split_whitespace()
            .map(|arg| {
                arg.replace("{url}", &file.content_fileurl)
                    .replace("{saved_to}", &file.saved_to)
            })
            .collect()
    }
}

impl DownloadExecutor for CommandExecutor {
    fn download(&self, _course: &CourseSnapshot, file: &FileRecord) -> Result<(), String> {
        let args = self.render(file);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| "download command is empty".to_string())?;

        let output = Command::new(program)
            .args(rest)
            .output()
            .map_err(|e| format!("failed to start '{program}': {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "'{}' exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
    /// Outcomes that could not be written back to the store.
    pub unrecorded: usize,
}

impl RetryReport {
    pub fn all_recovered(&self) -> bool {
        self.still_failing == 0 && self.unrecorded == 0
    }
}

/// Resubmits currently failing files to a `DownloadExecutor`.
pub struct RetryPass<'a, E: DownloadExecutor> {
    engine: &'a SyncEngine,
    executor: &'a E,
}

impl<'a, E: DownloadExecutor> RetryPass<'a, E> {
    pub fn new(engine: &'a SyncEngine, executor: &'a E) -> Self {
        RetryPass { engine, executor }
    }

    /// list failures → reset each for retry → download → record the outcome.
    pub fn run(
        &self,
        course_id: Option<i64>,
        min_consecutive_failures: i64,
    ) -> Result<RetryReport, CoursePulseError> {
        let db = self.engine.database();
        let courses = Outcomes::list_failures_by_course(db, min_consecutive_failures)?;

        let mut report = RetryReport::default();
        let mut outcomes = Vec::new();

        for course in courses
            .iter()
            .filter(|c| course_id.map_or(true, |id| id == c.course_id))
        {
            // Superseded and current rows can share a key; retry each key once
            let mut seen = HashSet::new();
            for file in course.files.iter().filter(|f| seen.insert(f.outcome_key())) {
                Outcomes::reset_for_retry(db, file, course.course_id)?;
                report.attempted += 1;

                match self.executor.download(course, file) {
                    Ok(()) => {
                        report.recovered += 1;
                        outcomes.push(DownloadOutcome::success(course, file));
                    }
                    Err(reason) => {
                        warn!("Retry of '{}' failed: {}", file.content_filename, reason);
                        report.still_failing += 1;
                        outcomes.push(DownloadOutcome::failed(course, file, &reason));
                    }
                }
            }
        }

        let recorded = self.engine.record_outcomes(&outcomes);
        report.unrecorded = recorded.errors.len();

        info!(
            "Retry pass: {} attempted, {} recovered, {} still failing",
            report.attempted, report.recovered, report.still_failing
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::SyncPolicy;
    use crate::database::open_temp_db;
    use crate::file_record::{test_file, DownloadStatus};
    use crate::files::Files;
    use std::cell::RefCell;

    /// Succeeds for URLs in `working`, records every call.
    struct FakeExecutor {
        working: Vec<String>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeExecutor {
        fn new(working: &[&str]) -> Self {
            FakeExecutor {
                working: working.iter().map(|s| s.to_string()).collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl DownloadExecutor for FakeExecutor {
        fn download(&self, _course: &CourseSnapshot, file: &FileRecord) -> Result<(), String> {
            self.calls.borrow_mut().push(file.content_fileurl.clone());
            if self.working.contains(&file.content_fileurl) {
                Ok(())
            } else {
                Err("still unreachable".to_string())
            }
        }
    }

    fn engine_with_failures() -> (tempfile::TempDir, SyncEngine, CourseSnapshot) {
        let (dir, db) = open_temp_db();
        let engine = SyncEngine::new(db, SyncPolicy::default());
        let course = CourseSnapshot {
            course_id: 101,
            course_fullname: "Test Course".to_string(),
            files: vec![
                test_file(5, "/", "a.pdf", "U1", 100, 1000),
                test_file(6, "/", "b.pdf", "U2", 100, 1000),
                test_file(7, "/", "c.pdf", "U3", 100, 1000),
            ],
        };
        engine.run(std::slice::from_ref(&course)).unwrap();
        engine.record_outcomes(&[
            DownloadOutcome::failed(&course, &course.files[0], "timeout"),
            DownloadOutcome::failed(&course, &course.files[1], "timeout"),
            DownloadOutcome::success(&course, &course.files[2]),
        ]);
        (dir, engine, course)
    }

    #[test]
    fn test_retry_recovers_some() {
        let (_dir, engine, _course) = engine_with_failures();
        let executor = FakeExecutor::new(&["U1"]);

        let report = RetryPass::new(&engine, &executor).run(None, 1).unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.still_failing, 1);
        assert!(!report.all_recovered());
        let mut calls = executor.calls.borrow().clone();
        calls.sort();
        assert_eq!(calls, vec!["U1", "U2"]);

        let failures = Outcomes::list_failures(engine.database(), None, 1).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].content_fileurl, "U2");
        // The streak restarted after the reset, the lifetime counter kept going
        assert_eq!(failures[0].consecutive_failures, 1);
        assert_eq!(failures[0].download_attempts, 2);

        let snapshot = Files::get_current_snapshot(engine.database()).unwrap();
        let a = snapshot[0].files.iter().find(|f| f.content_fileurl == "U1").unwrap();
        assert_eq!(a.download_status, DownloadStatus::Success);
        assert_eq!(a.download_attempts, 1);
    }

    #[test]
    fn test_retry_everything_recovered() {
        let (_dir, engine, _course) = engine_with_failures();
        let executor = FakeExecutor::new(&["U1", "U2"]);

        let report = RetryPass::new(&engine, &executor).run(None, 1).unwrap();

        assert!(report.all_recovered());
        assert!(Outcomes::list_failures(engine.database(), None, 1).unwrap().is_empty());
    }

    #[test]
    fn test_retry_counts_outcomes_that_could_not_be_written() {
        let (_dir, engine, _course) = engine_with_failures();
        engine
            .database()
            .get_connection()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_u2_success BEFORE UPDATE ON files
                 WHEN NEW.content_fileurl = 'U2' AND NEW.download_status = 'success'
                 BEGIN SELECT RAISE(ABORT, 'write rejected'); END;",
            )
            .unwrap();
        let executor = FakeExecutor::new(&["U1", "U2"]);

        let report = RetryPass::new(&engine, &executor).run(None, 1).unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.recovered, 2);
        assert_eq!(report.unrecorded, 1);
        assert!(!report.all_recovered());
    }

    #[test]
    fn test_retry_filters_by_course_and_threshold() {
        let (_dir, engine, _course) = engine_with_failures();
        let executor = FakeExecutor::new(&[]);

        let report = RetryPass::new(&engine, &executor).run(Some(999), 1).unwrap();
        assert_eq!(report.attempted, 0);

        let report = RetryPass::new(&engine, &executor).run(None, 2).unwrap();
        assert_eq!(report.attempted, 0);
        assert!(executor.calls.borrow().is_empty());
    }

    #[test]
    fn test_command_template_substitution() {
        let executor = CommandExecutor::new("fetch --out {saved_to} {url}");
        let mut file = test_file(5, "/", "a b.pdf", "https://m.example/a", 1, 1);
        file.saved_to = "/mirror/Week 1/a b.pdf".to_string();

        assert_eq!(
            executor.render(&file),
            vec!["fetch", "--out", "/mirror/Week 1/a b.pdf", "https://m.example/a"]
        );
    }

    #[test]
    fn test_command_executor_reports_failure() {
        let course = CourseSnapshot::new(101, "Test Course");
        let file = test_file(5, "/", "a.pdf", "U1", 1, 1);

        let empty = CommandExecutor::new("   ");
        assert!(empty.download(&course, &file).is_err());

        let missing = CommandExecutor::new("/nonexistent/coursepulse-fetch {url}");
        let err = missing.download(&course, &file).unwrap_err();
        assert!(err.contains("failed to start"));
    }
}
