//! Incremental content-state synchronization for mirrored course material.
//!
//! A fetch collaborator assembles one `CourseSnapshot` per course. `SyncEngine` compares the
//! snapshots with the stored state, persists the resulting `ChangeSet` and records download
//! outcomes reported afterwards.

pub mod cli;
pub mod comparator;
pub mod config;
pub mod database;
pub mod error;
pub mod file_record;
pub mod files;
pub mod logging;
pub mod outcomes;
pub mod retry;
pub mod schema;
pub mod sync;
pub mod utils;

pub use comparator::{ChangeKind, ChangeSet, FileChange, StateComparator, SyncPolicy};
pub use database::{Database, DatabaseOptions};
pub use error::CoursePulseError;
pub use file_record::{CourseSnapshot, DownloadStatus, FileRecord};
pub use files::Files;
pub use outcomes::Outcomes;
pub use retry::{DownloadExecutor, RetryPass, RetryReport};
pub use sync::{DownloadOutcome, DownloadResult, OutcomeReport, SyncEngine};
