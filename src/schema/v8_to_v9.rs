pub const UPGRADE_8_TO_9_SQL: &str = r#"
--
-- Schema Upgrade: Version 8 → 9
--
-- Indexes the outcome tracker key and the version chain back-reference.
--
CREATE INDEX IF NOT EXISTS idx_files_outcome_key ON files (course_id, module_id, content_fileurl);
CREATE INDEX IF NOT EXISTS idx_files_old_file_id ON files (old_file_id);
"#;
