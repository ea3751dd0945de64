use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use crate::config::Config;
use crate::database::Database;
use crate::error::CoursePulseError;
use crate::file_record::CourseSnapshot;
use crate::files::Files;
use crate::outcomes::Outcomes;
use crate::retry::{CommandExecutor, RetryPass};
use crate::sync::SyncEngine;

#[derive(Parser)]
#[command(
    name = "coursepulse",
    version,
    about = "coursePulse: incremental course content state tracking"
)]
pub struct Cli {
    /// Database file (overrides the configured path)
    #[arg(long = "db", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compare a freshly fetched listing with the stored state and persist the changes
    Sync {
        /// JSON file holding an array of course snapshots
        #[arg(long = "current")]
        current: PathBuf,

        /// Number files within each section before comparing
        #[arg(long = "assign-positions", default_value_t = false)]
        assign_positions: bool,
    },

    /// Print changes that have not been reported yet
    Unnotified,

    /// Mark every unreported change as reported
    MarkNotified,

    /// List files whose last download failed
    Failures {
        #[arg(long = "course")]
        course: Option<i64>,

        /// Minimum consecutive failures (default: from config)
        #[arg(long = "min-failures")]
        min_failures: Option<i64>,
    },

    /// Per-course failure statistics
    Summary,

    /// Retry failed downloads with the configured download command
    Retry {
        #[arg(long = "course")]
        course: Option<i64>,

        #[arg(long = "min-failures")]
        min_failures: Option<i64>,
    },

    /// List superseded versions that can be pruned
    OldVersions,

    /// Permanently remove rows by file id
    Prune {
        #[arg(long = "file-id", required = true, num_args = 1..)]
        file_ids: Vec<i64>,
    },

    /// Print the database schema version
    SchemaVersion,
}

impl Cli {
    /// Run the parsed command. Returns false when the command completed but reported a
    /// failure the process should signal through its exit code.
    pub fn handle_command_line(self, config: &Config, data_dir: &Path) -> Result<bool, CoursePulseError> {
        let db_path = self
            .db
            .clone()
            .unwrap_or_else(|| config.database.resolve_path(data_dir));
        let db = Database::open(&db_path, &config.database.options())?;

        match self.command {
            Command::Sync {
                current,
                assign_positions,
            } => {
                let json = fs::read_to_string(&current)?;
                let mut courses: Vec<CourseSnapshot> = serde_json::from_str(&json)?;
                if assign_positions {
                    courses.iter_mut().for_each(CourseSnapshot::assign_section_positions);
                }

                let engine = SyncEngine::new(db, config.sync.policy())
                    .with_failure_reason_max_len(config.sync.failure_reason_max_len);
                let changes = engine.run(&courses)?;
                print_json(&changes)?;
            }
            Command::Unnotified => print_json(&Files::list_unnotified(&db)?)?,
            Command::MarkNotified => {
                let files: Vec<_> = Files::list_unnotified(&db)?
                    .into_iter()
                    .flat_map(|course| course.entries.into_iter().map(|entry| entry.file))
                    .collect();
                let marked = Files::mark_notified(&db, &files)?;
                info!("Marked {} records as notified", marked);
                println!("{}", marked);
            }
            Command::Failures {
                course,
                min_failures,
            } => {
                let min = min_failures.unwrap_or(config.retry.min_consecutive_failures);
                print_json(&Outcomes::list_failures(&db, course, min)?)?;
            }
            Command::Summary => print_json(&Outcomes::failure_summary(&db)?)?,
            Command::Retry {
                course,
                min_failures,
            } => {
                let template = config.retry.command.as_deref().ok_or_else(|| {
                    CoursePulseError::Error(
                        "No download command configured ([retry] command)".to_string(),
                    )
                })?;
                let min = min_failures.unwrap_or(config.retry.min_consecutive_failures);

                let engine = SyncEngine::new(db, config.sync.policy())
                    .with_failure_reason_max_len(config.sync.failure_reason_max_len);
                let executor = CommandExecutor::new(template);
                let report = RetryPass::new(&engine, &executor).run(course, min)?;
                print_json(&report)?;
                return Ok(report.all_recovered());
            }
            Command::OldVersions => print_json(&Files::get_old_versions(&db)?)?,
            Command::Prune { file_ids } => {
                let removed = Files::prune(&db, &file_ids)?;
                println!("{}", removed);
            }
            Command::SchemaVersion => println!("{}", db.schema_version()?),
        }

        Ok(true)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CoursePulseError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
