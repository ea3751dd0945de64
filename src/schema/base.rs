/// Latest schema, created directly on a fresh database instead of replaying every upgrade.
/// Keep in sync with the end state of the migration chain.
pub const CREATE_SCHEMA_SQL: &str = r#"
-- One row per known remote content item (and per superseded version of it)
CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    course_id INTEGER NOT NULL,
    course_fullname TEXT NOT NULL,
    module_id INTEGER NOT NULL,
    section_name TEXT NOT NULL,
    section_id INTEGER DEFAULT 0 NOT NULL,
    module_name TEXT NOT NULL,
    content_filepath TEXT NOT NULL,
    content_filename TEXT NOT NULL,
    content_fileurl TEXT NOT NULL,
    content_filesize INTEGER DEFAULT 0 NOT NULL,
    content_timemodified INTEGER DEFAULT 0 NOT NULL,
    module_modname TEXT NOT NULL,
    content_type TEXT NOT NULL,
    content_isexternalfile INTEGER DEFAULT 0 NOT NULL,
    saved_to TEXT NOT NULL,
    time_stamp INTEGER DEFAULT 0 NOT NULL,
    modified INTEGER DEFAULT 0 NOT NULL,
    deleted INTEGER DEFAULT 0 NOT NULL,
    moved INTEGER DEFAULT 0 NOT NULL,
    notified INTEGER DEFAULT 0 NOT NULL,
    hash TEXT,
    old_file_id INTEGER DEFAULT NULL,      -- Version chain: the row this one supersedes
    download_status TEXT DEFAULT 'pending', -- 'pending', 'success' or 'failed'
    download_attempts INTEGER DEFAULT 0,    -- Lifetime counter, never reset
    last_download_at INTEGER DEFAULT 0,
    last_failed_at INTEGER DEFAULT 0,
    last_failed_reason TEXT,
    consecutive_failures INTEGER DEFAULT 0, -- Current failing streak
    position_in_section INTEGER             -- NULL for system files
);

CREATE INDEX IF NOT EXISTS idx_module_id ON files (module_id);
CREATE INDEX IF NOT EXISTS idx_course_id ON files (course_id);
CREATE INDEX IF NOT EXISTS idx_files_saved_to ON files (saved_to);
CREATE INDEX IF NOT EXISTS idx_files_time_stamp ON files (time_stamp);
CREATE INDEX IF NOT EXISTS idx_files_modified ON files (modified);
CREATE INDEX IF NOT EXISTS idx_files_deleted ON files (deleted);
CREATE INDEX IF NOT EXISTS idx_files_notified ON files (notified);
CREATE INDEX IF NOT EXISTS idx_download_status ON files (download_status);
CREATE INDEX IF NOT EXISTS idx_consecutive_failures ON files (consecutive_failures);
CREATE INDEX IF NOT EXISTS idx_position_in_section ON files (course_id, section_id, position_in_section);
CREATE INDEX IF NOT EXISTS idx_files_outcome_key ON files (course_id, module_id, content_fileurl);
CREATE INDEX IF NOT EXISTS idx_files_old_file_id ON files (old_file_id);
"#;

/// The original, unversioned `files` table. Only created when a database carries a version
/// marker but lost its table, so the upgrade chain has something to work on.
pub const LEGACY_FILES_V0_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
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
    time_stamp integer NOT NULL,
    modified integer DEFAULT 0 NOT NULL,
    deleted integer DEFAULT 0 NOT NULL,
    notified integer DEFAULT 0 NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_module_id ON files (module_id);
CREATE INDEX IF NOT EXISTS idx_course_id ON files (course_id);
"#;
