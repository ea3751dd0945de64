mod base;
mod v0_to_v1;
mod v1_to_v2;
mod v2_to_v3;
mod v3_to_v4;
mod v4_to_v5;
mod v5_to_v6;
mod v6_to_v7;
mod v7_to_v8;
mod v8_to_v9;

use log::{info, warn, Level};
use logging_timer::timer;
use rusqlite::{Connection, OptionalExtension};

use crate::database::Database;
use crate::error::CoursePulseError;

pub use base::{CREATE_SCHEMA_SQL, LEGACY_FILES_V0_SQL};
use v0_to_v1::migrate_0_to_1;
use v1_to_v2::migrate_1_to_2;
use v2_to_v3::UPGRADE_2_TO_3_SQL;
use v3_to_v4::migrate_3_to_4;
use v4_to_v5::migrate_4_to_5;
use v5_to_v6::migrate_5_to_6;
use v6_to_v7::{migrate_6_to_7, UPGRADE_6_TO_7_POST_SQL};
use v7_to_v8::{migrate_7_to_8, UPGRADE_7_TO_8_POST_SQL};
use v8_to_v9::UPGRADE_8_TO_9_SQL;

/// Schema version written by this build. Stored in `PRAGMA user_version`.
pub const LATEST_VERSION: i64 = 9;

/// Function type for migration code that transforms data during schema upgrades.
pub type MigrationFn = fn(&Connection) -> Result<(), CoursePulseError>;

/// Migration descriptor supporting 3-phase migrations:
/// - pre_sql: SQL batch to run before Rust code (optional)
/// - code_fn: Rust function for checks SQL cannot express, such as conditional ALTERs (optional)
/// - post_sql: SQL batch to run after Rust code (optional)
///
/// All three phases and the version bump run in one immediate transaction.
pub struct Migration {
    pub target_version: i64,
    pub description: &'static str,
    pub pre_sql: Option<&'static str>,
    pub code_fn: Option<MigrationFn>,
    pub post_sql: Option<&'static str>,
}

impl Migration {
    /// Create a SQL-only migration (no Rust code needed)
    pub const fn sql_only(
        target_version: i64,
        description: &'static str,
        sql: &'static str,
    ) -> Self {
        Self {
            target_version,
            description,
            pre_sql: Some(sql),
            code_fn: None,
            post_sql: None,
        }
    }

    pub const fn code(
        target_version: i64,
        description: &'static str,
        code_fn: MigrationFn,
        post_sql: Option<&'static str>,
    ) -> Self {
        Self {
            target_version,
            description,
            pre_sql: None,
            code_fn: Some(code_fn),
            post_sql,
        }
    }
}

pub const MIGRATIONS: [Migration; 9] = [
    Migration::code(1, "content hash", migrate_0_to_1, None),
    Migration::code(2, "moved flag", migrate_1_to_2, None),
    Migration::sql_only(3, "reset legacy modified flags", UPGRADE_2_TO_3_SQL),
    Migration::code(4, "file identity and version chain", migrate_3_to_4, None),
    Migration::code(5, "section id", migrate_4_to_5, None),
    Migration::code(6, "version alignment", migrate_5_to_6, None),
    Migration::code(
        7,
        "download outcome tracking",
        migrate_6_to_7,
        Some(UPGRADE_6_TO_7_POST_SQL),
    ),
    Migration::code(
        8,
        "position in section",
        migrate_7_to_8,
        Some(UPGRADE_7_TO_8_POST_SQL),
    ),
    Migration::sql_only(9, "outcome and chain indexes", UPGRADE_8_TO_9_SQL),
];

pub fn schema_version(conn: &Connection) -> Result<i64, CoursePulseError> {
    let version = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), CoursePulseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

pub fn files_table_exists(conn: &Connection) -> Result<bool, CoursePulseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'files'",
            [],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, CoursePulseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Adds `column` unless it is already present. Returns true if the column was added.
///
/// `table`, `column` and `decl` are compile-time constants from the migration steps.
pub(crate) fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<bool, CoursePulseError> {
    if column_exists(conn, table, column)? {
        return Ok(false);
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
    Ok(true)
}

/// Bring the database to `LATEST_VERSION`.
///
/// A database with no `files` table and version 0 gets the latest schema directly. Anything
/// else walks the upgrade chain one committed step at a time, so an interrupted upgrade
/// resumes from the last completed step on the next open.
pub fn migrate(conn: &Connection) -> Result<(), CoursePulseError> {
    let _tmr = timer!(Level::Debug; "schema::migrate");

    let version = schema_version(conn)?;
    if version > LATEST_VERSION {
        return Err(CoursePulseError::UnsupportedSchemaVersion {
            found: version,
            supported: LATEST_VERSION,
        });
    }
    if version == LATEST_VERSION && files_table_exists(conn)? {
        return Ok(());
    }

    if version == 0 && !files_table_exists(conn)? {
        let created = Database::immediate_transaction(conn, |c| {
            // Another process may have won the race between the check and the lock
            if schema_version(c)? != 0 || files_table_exists(c)? {
                return Ok(false);
            }
            c.execute_batch(CREATE_SCHEMA_SQL)?;
            set_schema_version(c, LATEST_VERSION)?;
            Ok(true)
        })?;
        if created {
            info!("Created database schema at version {}", LATEST_VERSION);
            return Ok(());
        }
    }

    if !files_table_exists(conn)? {
        Database::immediate_transaction(conn, |c| {
            if files_table_exists(c)? {
                return Ok(());
            }
            warn!(
                "Database reports schema version {} but has no files table; recreating the original table and upgrading from version 0",
                schema_version(c)?
            );
            c.execute_batch(LEGACY_FILES_V0_SQL)?;
            set_schema_version(c, 0)
        })?;
    }

    for migration in MIGRATIONS.iter() {
        apply_migration(conn, migration)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<(), CoursePulseError> {
    let applied = Database::immediate_transaction(conn, |c| {
        let current = schema_version(c)?;
        if current >= migration.target_version {
            return Ok(false);
        }
        if current != migration.target_version - 1 {
            return Err(CoursePulseError::Error(format!(
                "Expected schema version {} before this step, found {}",
                migration.target_version - 1,
                current
            )));
        }

        if let Some(sql) = migration.pre_sql {
            c.execute_batch(sql)?;
        }
        if let Some(code_fn) = migration.code_fn {
            code_fn(c)?;
        }
        if let Some(sql) = migration.post_sql {
            c.execute_batch(sql)?;
        }

        set_schema_version(c, migration.target_version)?;
        Ok(true)
    })
    .map_err(|e| CoursePulseError::Migration {
        version: migration.target_version,
        source: Box::new(e),
    })?;

    if applied {
        info!(
            "Upgraded database schema to version {} ({})",
            migration.target_version, migration.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_FILES_V0_SQL).unwrap();
        conn.execute(
            "INSERT INTO files (course_id, course_fullname, module_id, section_name, module_name,
                content_filepath, content_filename, content_fileurl, content_filesize,
                content_timemodified, module_modname, content_type, content_isexternalfile,
                saved_to, time_stamp, modified, deleted, notified)
             VALUES (5, 'Algebra', 42, 'Week 1', 'Slides', '/', 'a.pdf',
                'https://m.example/a.pdf', 100, 1000, 'resource', 'file', 'False',
                '/mirror/Algebra/Week 1/a.pdf', 1000, 1, 0, 1)",
            [],
        )
        .unwrap();
        conn
    }

    /// Brings a legacy database up to `version` by running the chain partially.
    fn legacy_db_at(version: i64) -> Connection {
        let conn = legacy_db();
        for migration in MIGRATIONS.iter().filter(|m| m.target_version <= version) {
            apply_migration(&conn, migration).unwrap();
        }
        assert_eq!(schema_version(&conn).unwrap(), version);
        conn
    }

    fn columns(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info('files') ORDER BY cid")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    fn assert_latest_columns(conn: &Connection) {
        let cols = columns(conn);
        for expected in [
            "file_id",
            "old_file_id",
            "hash",
            "moved",
            "section_id",
            "download_status",
            "download_attempts",
            "last_download_at",
            "last_failed_at",
            "last_failed_reason",
            "consecutive_failures",
            "position_in_section",
        ] {
            assert!(cols.iter().any(|c| c == expected), "missing column {expected}");
        }
    }

    #[test]
    fn test_fresh_database_gets_latest_schema() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), LATEST_VERSION);
        assert_latest_columns(&conn);
    }

    #[test]
    fn test_migrate_is_noop_at_latest() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn test_legacy_database_upgrades_from_every_version() {
        for start in 0..LATEST_VERSION {
            let conn = legacy_db_at(start);
            migrate(&conn).unwrap();

            assert_eq!(schema_version(&conn).unwrap(), LATEST_VERSION, "start {start}");
            assert_latest_columns(&conn);

            let (file_id, modified, status, section_id): (i64, i64, String, i64) = conn
                .query_row(
                    "SELECT file_id, modified, download_status, section_id FROM files",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .unwrap();
            assert_eq!(file_id, 1);
            // 2→3 cleared the legacy meaning of `modified`
            assert_eq!(modified, 0);
            assert_eq!(status, "success");
            assert_eq!(section_id, 0);
        }
    }

    #[test]
    fn test_steps_tolerate_already_applied_columns() {
        // A step that committed its columns but not its version bump must be re-runnable
        for start in 0..LATEST_VERSION {
            let conn = Connection::open_in_memory().unwrap();
            conn.execute_batch(CREATE_SCHEMA_SQL).unwrap();
            set_schema_version(&conn, start).unwrap();

            migrate(&conn).unwrap();
            assert_eq!(schema_version(&conn).unwrap(), LATEST_VERSION, "start {start}");
        }
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        set_schema_version(&conn, LATEST_VERSION + 1).unwrap();

        let err = migrate(&conn).unwrap_err();
        assert!(matches!(
            err,
            CoursePulseError::UnsupportedSchemaVersion { found, supported }
                if found == LATEST_VERSION + 1 && supported == LATEST_VERSION
        ));
    }

    #[test]
    fn test_version_marker_without_table_recreates_and_upgrades() {
        for marker in [1, 4, 8] {
            let conn = Connection::open_in_memory().unwrap();
            set_schema_version(&conn, marker).unwrap();

            migrate(&conn).unwrap();
            assert_eq!(schema_version(&conn).unwrap(), LATEST_VERSION, "marker {marker}");
            assert_latest_columns(&conn);
        }
    }

    #[test]
    fn test_migrations_are_contiguous() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.target_version, i as i64 + 1);
        }
        assert_eq!(MIGRATIONS.len() as i64, LATEST_VERSION);
    }
}
