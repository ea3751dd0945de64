use std::collections::HashSet;

use log::{debug, Level};
use logging_timer::timer;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::file_record::{CourseSnapshot, FileRecord};

/// Module kinds whose absence from a listing does not imply deletion by default.
pub const DEFAULT_SUPPRESSED_KINDS: [&str; 2] = ["forum", "calendar"];

/// Classification policy owned by the comparator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// A stored record whose `module_modname` ends with one of these is never marked deleted.
    pub suppressed_kinds: Vec<String>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            suppressed_kinds: DEFAULT_SUPPRESSED_KINDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

#[derive(AsRefStr, EnumString, Display, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Modified,
    Moved,
    Deleted,
}

/// A single classified record.
///
/// For `Modified` and `Moved`, `file` is the current record and `old_file` the stored record
/// it supersedes. For `Deleted`, `file` is the stored record. For `New`, `old_file` is `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub file: FileRecord,
    pub old_file: Option<FileRecord>,
}

impl FileChange {
    fn new_file(file: &FileRecord) -> Self {
        FileChange {
            kind: ChangeKind::New,
            file: file.clone(),
            old_file: None,
        }
    }

    fn superseding(kind: ChangeKind, current: &FileRecord, stored: &FileRecord) -> Self {
        let mut file = current.clone();
        file.modified = kind == ChangeKind::Modified;
        file.moved = kind == ChangeKind::Moved;
        FileChange {
            kind,
            file,
            old_file: Some(stored.clone()),
        }
    }

    fn deleted(stored: &FileRecord) -> Self {
        let mut file = stored.clone();
        file.deleted = true;
        file.notified = false;
        FileChange {
            kind: ChangeKind::Deleted,
            file,
            old_file: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseChanges {
    pub course_id: i64,
    pub course_fullname: String,
    pub changes: Vec<FileChange>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub new_count: usize,
    pub modified_count: usize,
    pub moved_count: usize,
    pub deleted_count: usize,
}

/// Courses containing only new, modified, moved or deleted records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub courses: Vec<CourseChanges>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.courses.iter().all(|c| c.changes.is_empty())
    }

    pub fn len(&self) -> usize {
        self.courses.iter().map(|c| c.changes.len()).sum()
    }

    pub fn course(&self, course_id: i64) -> Option<&CourseChanges> {
        self.courses.iter().find(|c| c.course_id == course_id)
    }

    pub fn iter_changes(&self) -> impl Iterator<Item = (&CourseChanges, &FileChange)> {
        self.courses
            .iter()
            .flat_map(|course| course.changes.iter().map(move |change| (course, change)))
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for (_, change) in self.iter_changes() {
            match change.kind {
                ChangeKind::New => counts.new_count += 1,
                ChangeKind::Modified => counts.modified_count += 1,
                ChangeKind::Moved => counts.moved_count += 1,
                ChangeKind::Deleted => counts.deleted_count += 1,
            }
        }
        counts
    }

    fn push(&mut self, course_id: i64, course_fullname: &str, changes: Vec<FileChange>) {
        if changes.is_empty() {
            return;
        }
        match self.courses.iter_mut().find(|c| c.course_id == course_id) {
            Some(existing) => existing.changes.extend(changes),
            None => self.courses.push(CourseChanges {
                course_id,
                course_fullname: course_fullname.to_owned(),
                changes,
            }),
        }
    }
}

/// Two-pass diff of a stored snapshot against a freshly fetched one.
///
/// Pass 1 walks the stored courses looking for modifications, moves and deletions. Pass 2
/// walks the current courses looking for additions. Neither input is mutated: current records
/// claimed in pass 1 are tracked in a per-course matched-index set.
pub struct StateComparator {
    policy: SyncPolicy,
}

/// Pass 1 result for one course present on both sides.
#[derive(Default)]
struct CourseMatches {
    /// Indices of current records claimed by a stored record.
    claimed: HashSet<usize>,
    /// Indices of stored records that stay current after this pass (unchanged or suppressed).
    retained: HashSet<usize>,
}

impl StateComparator {
    pub fn new(policy: SyncPolicy) -> Self {
        StateComparator { policy }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn compare(&self, stored: &[CourseSnapshot], current: &[CourseSnapshot]) -> ChangeSet {
        let _tmr = timer!(Level::Debug; "StateComparator::compare");

        let mut change_set = ChangeSet::default();
        let mut matches: Vec<(i64, CourseMatches)> = Vec::new();

        for stored_course in stored {
            match current.iter().find(|c| c.course_id == stored_course.course_id) {
                None => {
                    debug!(
                        "Course {} is no longer listed, marking its files deleted",
                        stored_course.course_id
                    );
                    let changes = stored_course
                        .files
                        .iter()
                        .filter(|f| !f.is_deletion_suppressed(&self.policy.suppressed_kinds))
                        .map(FileChange::deleted)
                        .collect();
                    change_set.push(stored_course.course_id, &stored_course.course_fullname, changes);
                }
                Some(current_course) => {
                    let (changes, course_matches) =
                        self.modifications_and_deletions(stored_course, current_course);
                    change_set.push(stored_course.course_id, &stored_course.course_fullname, changes);
                    matches.push((stored_course.course_id, course_matches));
                }
            }
        }

        for current_course in current {
            let changes = match stored.iter().find(|c| c.course_id == current_course.course_id) {
                None => current_course.files.iter().map(FileChange::new_file).collect(),
                Some(stored_course) => {
                    let empty = CourseMatches::default();
                    let course_matches = matches
                        .iter()
                        .find(|(course_id, _)| *course_id == current_course.course_id)
                        .map(|(_, m)| m)
                        .unwrap_or(&empty);
                    Self::additions(stored_course, current_course, course_matches)
                }
            };
            change_set.push(current_course.course_id, &current_course.course_fullname, changes);
        }

        let counts = change_set.counts();
        debug!(
            "Comparison complete: {} new, {} modified, {} moved, {} deleted",
            counts.new_count, counts.modified_count, counts.moved_count, counts.deleted_count
        );

        change_set
    }

    /// Pass 1 for one course present on both sides.
    ///
    /// Among several current records at the stored record's path, an unchanged one wins over a
    /// changed one, and an unclaimed one wins over a claimed one.
    fn modifications_and_deletions(
        &self,
        stored_course: &CourseSnapshot,
        current_course: &CourseSnapshot,
    ) -> (Vec<FileChange>, CourseMatches) {
        let mut changes = Vec::new();
        let mut matches = CourseMatches::default();

        for (stored_idx, stored_file) in stored_course.files.iter().enumerate() {
            let same_path = current_course
                .files
                .iter()
                .enumerate()
                .filter(|(_, current_file)| current_file.same_path(stored_file))
                .min_by_key(|(idx, current_file)| {
                    (current_file.is_different(stored_file), matches.claimed.contains(idx))
                });

            if let Some((idx, current_file)) = same_path {
                matches.claimed.insert(idx);
                if current_file.is_different(stored_file) {
                    changes.push(FileChange::superseding(ChangeKind::Modified, current_file, stored_file));
                } else {
                    matches.retained.insert(stored_idx);
                }
                continue;
            }

            let moved_to = current_course
                .files
                .iter()
                .enumerate()
                .filter(|(_, current_file)| current_file.was_moved(stored_file))
                .min_by_key(|(idx, _)| matches.claimed.contains(idx));

            match moved_to {
                Some((idx, current_file)) => {
                    matches.claimed.insert(idx);
                    changes.push(FileChange::superseding(ChangeKind::Moved, current_file, stored_file));
                }
                None if !stored_file.is_deletion_suppressed(&self.policy.suppressed_kinds) => {
                    changes.push(FileChange::deleted(stored_file));
                }
                None => {
                    matches.retained.insert(stored_idx);
                }
            }
        }

        (changes, matches)
    }

    /// Pass 2 for one course present on both sides. A current record is new unless pass 1
    /// claimed it, or a stored record that stays current matches it by path or by move.
    ///
    /// Stored records superseded or deleted in pass 1 leave the current state and do not
    /// shadow additions.
    fn additions(
        stored_course: &CourseSnapshot,
        current_course: &CourseSnapshot,
        matches: &CourseMatches,
    ) -> Vec<FileChange> {
        let retained: Vec<&FileRecord> = stored_course
            .files
            .iter()
            .enumerate()
            .filter(|(idx, _)| matches.retained.contains(idx))
            .map(|(_, stored_file)| stored_file)
            .collect();

        current_course
            .files
            .iter()
            .enumerate()
            .filter(|(idx, _)| !matches.claimed.contains(idx))
            .filter(|(_, current_file)| {
                !retained.iter().any(|stored_file| {
                    current_file.same_path(stored_file) || current_file.was_moved(stored_file)
                })
            })
            .map(|(_, current_file)| FileChange::new_file(current_file))
            .collect()
    }
}

impl Default for StateComparator {
    fn default() -> Self {
        StateComparator::new(SyncPolicy::default())
    }
}
