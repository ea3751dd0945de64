pub const UPGRADE_2_TO_3_SQL: &str = r#"
--
-- Schema Upgrade: Version 2 → 3
--
-- `modified` now marks a row that was superseded by a newer version of the same file.
-- Rows flagged under the old meaning are current content and must be cleared.
--
UPDATE files
SET modified = 0
WHERE modified = 1;
"#;
