use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};

/// Generated module/course description text.
pub const TYPE_DESCRIPTION: &str = "description";
/// Generated HTML content (pages, calendar entries, ...).
pub const TYPE_HTML: &str = "html";
/// Link extracted from a description. Its `module_modname` layout changed historically.
pub const TYPE_DESCRIPTION_URL: &str = "description-url";

#[derive(
    AsRefStr, EnumString, Display, Debug, Default, PartialEq, Eq, Copy, Clone, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl DownloadStatus {
    /// Interpret a stored status column. NULL or unknown values fall back to `Pending`.
    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            None => DownloadStatus::Pending,
            Some(s) => s.parse().unwrap_or_else(|_| {
                warn!(
                    "Invalid download_status value in database: '{}', defaulting to pending",
                    s
                );
                DownloadStatus::Pending
            }),
        }
    }
}

/// One tracked remote content item and its local projection.
///
/// Collaborators build these from remote payloads with every field already normalized
/// (decoded URLs, Unix-second timestamps, byte sizes). `file_id` is assigned by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRecord {
    pub file_id: Option<i64>,
    pub old_file_id: Option<i64>,

    pub course_id: i64,
    pub course_fullname: String,
    pub module_id: i64,
    pub section_id: i64,
    pub section_name: String,
    pub module_name: String,
    pub module_modname: String,
    pub content_filepath: String,
    pub content_filename: String,
    pub position_in_section: Option<i64>,

    pub content_fileurl: String,
    pub content_filesize: i64,
    pub content_timemodified: i64,
    pub content_type: String,
    pub content_isexternalfile: bool,
    pub hash: Option<String>,

    pub saved_to: String,
    pub time_stamp: i64,

    pub modified: bool,
    pub moved: bool,
    pub deleted: bool,
    pub notified: bool,

    pub download_status: DownloadStatus,
    pub download_attempts: i64,
    pub last_download_at: i64,
    pub last_failed_at: i64,
    pub last_failed_reason: Option<String>,
    pub consecutive_failures: i64,
}

impl FileRecord {
    /// True if both records describe the same kind of content.
    ///
    /// `description-url` records also match when one `module_modname` is a prefix of the
    /// other: older databases stored a shorter modname for these links and matching them
    /// keeps already downloaded links from being fetched again.
    pub fn same_type(&self, other: &FileRecord) -> bool {
        if self.content_type == other.content_type && self.module_modname == other.module_modname {
            return true;
        }

        self.content_type == TYPE_DESCRIPTION_URL
            && self.content_type == other.content_type
            && (self.module_modname.starts_with(&other.module_modname)
                || other.module_modname.starts_with(&self.module_modname))
    }

    /// True if both records sit at the same location in the course.
    pub fn same_path(&self, other: &FileRecord) -> bool {
        self.module_id == other.module_id
            && self.section_name == other.section_name
            && self.content_filepath == other.content_filepath
            && self.content_filename == other.content_filename
            && self.same_type(other)
            && (self.content_type != TYPE_DESCRIPTION || self.module_name == other.module_name)
    }

    /// True if the content behind the two records differs.
    ///
    /// A URL change alone is not enough: some servers rewrite URLs without touching the
    /// content, so the modification time has to change too. Generated text content has no
    /// stable URL and is compared by fingerprint instead.
    pub fn is_different(&self, other: &FileRecord) -> bool {
        if self.content_filesize != other.content_filesize
            || (self.content_fileurl != other.content_fileurl
                && self.content_timemodified != other.content_timemodified)
        {
            return true;
        }

        let same_content_type = self.content_type == other.content_type;

        if same_content_type
            && (self.content_type == TYPE_DESCRIPTION || self.content_type == TYPE_HTML)
            && (self.hash != other.hash || self.content_timemodified != other.content_timemodified)
        {
            return true;
        }

        same_content_type
            && self.content_type == TYPE_DESCRIPTION_URL
            && self.content_fileurl != other.content_fileurl
    }

    /// Descriptions, and HTML without a fingerprint, cannot be told apart from a replacement
    /// when their location changes.
    pub fn is_moveable(&self, other: &FileRecord) -> bool {
        if self.content_type == TYPE_DESCRIPTION || other.content_type == TYPE_DESCRIPTION {
            return false;
        }

        !((self.content_type == TYPE_HTML && self.hash.is_none())
            || (other.content_type == TYPE_HTML && other.hash.is_none()))
    }

    /// True if `self` is `other` relocated without a content change.
    pub fn was_moved(&self, other: &FileRecord) -> bool {
        !self.is_different(other)
            && self.same_type(other)
            && !self.same_path(other)
            && self.is_moveable(other)
    }

    /// True if the record was reported by a suppressed kind, whose absence from a listing
    /// does not mean the content was removed.
    pub fn is_deletion_suppressed(&self, suppressed_kinds: &[String]) -> bool {
        suppressed_kinds
            .iter()
            .any(|kind| self.module_modname.ends_with(kind.as_str()))
    }

    /// Outcome tracker key: `file_id` may not be known when a download fails.
    pub fn outcome_key(&self) -> (i64, i64, &str) {
        (self.course_id, self.module_id, self.content_fileurl.as_str())
    }

    /// Filename prefixed with the one-based section ordinal, e.g. `"05 notes.pdf"`.
    /// System files keep their plain name.
    pub fn indexed_filename(&self) -> String {
        match self.position_in_section {
            Some(pos) => format!("{:02} {}", pos + 1, self.content_filename),
            None => self.content_filename.clone(),
        }
    }

    /// Names the engine treats as generated system entries rather than course content.
    pub fn is_system_file(filename: &str) -> bool {
        let lower = filename.to_lowercase();
        lower == "metadata.json" || lower == "table of contents.html" || filename.starts_with('.')
    }

    /// Hex SHA-256 of generated content, stored in `hash` for description/html records.
    pub fn content_fingerprint(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Assign dense, zero-based ordinals to the non-system files of one section, in slice order.
pub fn assign_positions(files: &mut [FileRecord]) {
    let mut next = 0;
    for file in files.iter_mut() {
        if FileRecord::is_system_file(&file.content_filename) {
            file.position_in_section = None;
        } else {
            file.position_in_section = Some(next);
            next += 1;
        }
    }
}

/// The complete set of records for one course at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSnapshot {
    pub course_id: i64,
    pub course_fullname: String,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl CourseSnapshot {
    pub fn new(course_id: i64, course_fullname: &str) -> Self {
        CourseSnapshot {
            course_id,
            course_fullname: course_fullname.to_owned(),
            files: Vec::new(),
        }
    }

    /// Assign section ordinals course-wide. Files keep their order; each section is numbered
    /// independently in order of appearance.
    pub fn assign_section_positions(&mut self) {
        let mut section_ids: Vec<i64> = Vec::new();
        for file in &self.files {
            if !section_ids.contains(&file.section_id) {
                section_ids.push(file.section_id);
            }
        }

        for section_id in section_ids {
            let mut next = 0;
            for file in self.files.iter_mut().filter(|f| f.section_id == section_id) {
                if FileRecord::is_system_file(&file.content_filename) {
                    file.position_in_section = None;
                } else {
                    file.position_in_section = Some(next);
                    next += 1;
                }
            }
        }
    }
}

/// Compact record builder for tests across the crate.
#[cfg(test)]
pub(crate) fn test_file(module_id: i64, path: &str, name: &str, url: &str, size: i64, time: i64) -> FileRecord {
    FileRecord {
        course_id: 101,
        course_fullname: "Test Course".to_string(),
        module_id,
        section_id: 1,
        section_name: "Week 1".to_string(),
        module_name: "Lecture notes".to_string(),
        module_modname: "resource".to_string(),
        content_filepath: path.to_string(),
        content_filename: name.to_string(),
        content_fileurl: url.to_string(),
        content_filesize: size,
        content_timemodified: time,
        content_type: "file".to_string(),
        saved_to: format!("/mirror/Test Course/Week 1{}{}", path, name),
        time_stamp: time,
        ..FileRecord::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(path: &str, size: i64, url: &str, time: i64) -> FileRecord {
        test_file(5, path, "f.pdf", url, size, time)
    }

    #[test]
    fn test_download_status_strings() {
        assert_eq!(DownloadStatus::Pending.as_ref(), "pending");
        assert_eq!(DownloadStatus::Success.to_string(), "success");
        assert_eq!("failed".parse::<DownloadStatus>().unwrap(), DownloadStatus::Failed);
        assert!("Failed!".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_download_status_from_db_falls_back_to_pending() {
        assert_eq!(DownloadStatus::from_db(None), DownloadStatus::Pending);
        assert_eq!(DownloadStatus::from_db(Some("bogus")), DownloadStatus::Pending);
        assert_eq!(DownloadStatus::from_db(Some("success")), DownloadStatus::Success);
    }

    #[test]
    fn test_same_type_exact_match() {
        let a = file("/", 1, "U", 1);
        let mut b = a.clone();
        assert!(a.same_type(&b));

        b.module_modname = "folder".to_string();
        assert!(!a.same_type(&b));
    }

    #[test]
    fn test_same_type_description_url_prefix() {
        let mut a = file("/", 1, "U", 1);
        a.content_type = TYPE_DESCRIPTION_URL.to_string();
        a.module_modname = "url".to_string();
        let mut b = a.clone();
        b.module_modname = "url-description".to_string();

        assert!(a.same_type(&b));
        assert!(b.same_type(&a));

        // The prefix rule only applies to description-url records
        a.content_type = "file".to_string();
        b.content_type = "file".to_string();
        assert!(!a.same_type(&b));
    }

    #[test]
    fn test_same_path_requires_module_name_for_descriptions() {
        let mut a = file("/", 1, "U", 1);
        a.content_type = TYPE_DESCRIPTION.to_string();
        let mut b = a.clone();
        assert!(a.same_path(&b));

        b.module_name = "Renamed module".to_string();
        assert!(!a.same_path(&b));

        // Other types ignore the module name
        a.content_type = "file".to_string();
        b.content_type = "file".to_string();
        assert!(a.same_path(&b));
    }

    #[test]
    fn test_is_different_size_or_url_and_time() {
        let a = file("/", 100, "U", 1000);

        assert!(!a.is_different(&a.clone()));
        assert!(a.is_different(&file("/", 200, "U", 1000)));
        // URL rewrite without a time change is not a modification
        assert!(!a.is_different(&file("/", 100, "U2", 1000)));
        // Time change alone is not a modification for plain files
        assert!(!a.is_different(&file("/", 100, "U", 2000)));
        assert!(a.is_different(&file("/", 100, "U2", 2000)));
    }

    #[test]
    fn test_is_different_generated_content_uses_fingerprint() {
        let mut a = file("/", 0, "", 1000);
        a.content_type = TYPE_HTML.to_string();
        a.hash = Some(FileRecord::content_fingerprint("<p>a</p>"));
        let mut b = a.clone();
        assert!(!a.is_different(&b));

        b.hash = Some(FileRecord::content_fingerprint("<p>b</p>"));
        assert!(a.is_different(&b));

        b.hash = a.hash.clone();
        b.content_timemodified = 1001;
        assert!(a.is_different(&b));
    }

    #[test]
    fn test_is_different_description_url() {
        let mut a = file("/", 0, "https://a.example", 1000);
        a.content_type = TYPE_DESCRIPTION_URL.to_string();
        let mut b = a.clone();
        b.content_fileurl = "https://b.example".to_string();
        assert!(a.is_different(&b));
    }

    #[test]
    fn test_is_moveable() {
        let plain = file("/", 1, "U", 1);
        let mut description = plain.clone();
        description.content_type = TYPE_DESCRIPTION.to_string();
        let mut html = plain.clone();
        html.content_type = TYPE_HTML.to_string();

        assert!(plain.is_moveable(&plain));
        assert!(!plain.is_moveable(&description));
        assert!(!description.is_moveable(&plain));
        assert!(!html.is_moveable(&html));

        html.hash = Some("abc".to_string());
        assert!(html.is_moveable(&html));
    }

    #[test]
    fn test_was_moved_vs_modified() {
        let stored = file("/a/", 100, "U", 1000);
        let relocated = file("/b/", 100, "U", 1000);
        assert!(relocated.was_moved(&stored));

        // Differing size defeats the move
        let resized = file("/b/", 200, "U", 1000);
        assert!(!resized.was_moved(&stored));

        // Same location is never a move
        assert!(!stored.clone().was_moved(&stored));
    }

    #[test]
    fn test_deletion_suppression_matches_suffix() {
        let kinds = vec!["forum".to_string(), "calendar".to_string()];
        let mut f = file("/", 1, "U", 1);
        f.module_modname = "forum".to_string();
        assert!(f.is_deletion_suppressed(&kinds));
        f.module_modname = "cookie_mod-forum".to_string();
        assert!(f.is_deletion_suppressed(&kinds));
        f.module_modname = "resource".to_string();
        assert!(!f.is_deletion_suppressed(&kinds));
    }

    #[test]
    fn test_is_system_file() {
        assert!(FileRecord::is_system_file("metadata.json"));
        assert!(FileRecord::is_system_file("Table of Contents.html"));
        assert!(FileRecord::is_system_file(".DS_Store"));
        assert!(!FileRecord::is_system_file("lecture.pdf"));
        assert!(!FileRecord::is_system_file("01-introduction.pdf"));
    }

    #[test]
    fn test_assign_positions_skips_system_files() {
        let mut files: Vec<FileRecord> = ["file1.pdf", "metadata.json", "file2.pdf", ".hidden", "file3.pdf"]
            .iter()
            .map(|name| test_file(1, "/", name, "U", 1, 1))
            .collect();

        assign_positions(&mut files);

        let positions: Vec<Option<i64>> = files.iter().map(|f| f.position_in_section).collect();
        assert_eq!(positions, vec![Some(0), None, Some(1), None, Some(2)]);
    }

    #[test]
    fn test_assign_positions_empty_and_all_system() {
        let mut empty: Vec<FileRecord> = Vec::new();
        assign_positions(&mut empty);
        assert!(empty.is_empty());

        let mut files = vec![test_file(1, "/", "metadata.json", "U", 1, 1)];
        files[0].position_in_section = Some(3);
        assign_positions(&mut files);
        assert_eq!(files[0].position_in_section, None);
    }

    #[test]
    fn test_assign_section_positions_numbers_each_section() {
        let mut course = CourseSnapshot::new(101, "Test Course");
        for (section, name) in [(1, "a.pdf"), (2, "b.pdf"), (1, "c.pdf"), (2, "metadata.json"), (2, "d.pdf")] {
            let mut f = test_file(1, "/", name, "U", 1, 1);
            f.section_id = section;
            course.files.push(f);
        }

        course.assign_section_positions();

        let positions: Vec<Option<i64>> = course.files.iter().map(|f| f.position_in_section).collect();
        assert_eq!(positions, vec![Some(0), Some(0), Some(1), None, Some(1)]);
    }

    #[test]
    fn test_indexed_filename() {
        let mut f = test_file(1, "/", "01-introduction.pdf", "U", 1, 1);
        assert_eq!(f.indexed_filename(), "01-introduction.pdf");

        f.position_in_section = Some(4);
        assert_eq!(f.indexed_filename(), "05 01-introduction.pdf");

        f.position_in_section = Some(99);
        assert_eq!(f.indexed_filename(), "100 01-introduction.pdf");
    }

    #[test]
    fn test_content_fingerprint_is_stable_hex() {
        let fp = FileRecord::content_fingerprint("hello");
        assert_eq!(fp.len(), 64);
        assert_eq!(
            fp,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_file_record_deserializes_with_defaults() {
        let json = r#"{
            "course_id": 101,
            "module_id": 5,
            "content_filepath": "/",
            "content_filename": "a.pdf",
            "content_fileurl": "https://example.com/a.pdf",
            "content_filesize": 100
        }"#;
        let f: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(f.file_id, None);
        assert_eq!(f.download_status, DownloadStatus::Pending);
        assert!(!f.deleted);
        assert_eq!(f.content_filesize, 100);
    }
}
