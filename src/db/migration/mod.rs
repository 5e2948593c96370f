pub mod introspect;

use log::{info, warn};
use rusqlite::{Connection, OptionalExtension};

use crate::db::schema::{create_current_schema, CURRENT_SCHEMA_VERSION, META_TABLE_SQL, MIGRATIONS};
use crate::error::MapMarkError;

use introspect::{column_exists, table_exists};

/// Function type for migration code that transforms data during schema upgrades.
pub type MigrationFn = fn(&Connection) -> Result<(), MapMarkError>;

/// Migration descriptor supporting 3-phase migrations:
/// - pre_sql: SQL batch to run before Rust code (optional)
/// - code_fn: Rust function for transformations that depend on the
///   existing shape, such as column introspection (optional)
/// - post_sql: SQL batch to run after Rust code (optional)
///
/// All phases of one migration, plus the version bump, share a single
/// transaction.
pub struct Migration {
    pub target_version: u32,
    pub description: &'static str,
    pub pre_sql: Option<&'static str>,
    pub code_fn: Option<MigrationFn>,
    pub post_sql: Option<&'static str>,
}

/// What `detect_schema` found on disk.
#[derive(Debug, PartialEq, Eq)]
pub enum SchemaState {
    /// No tables yet
    Empty,
    /// `meta` carries a schema version
    Versioned(u32),
    /// Tables from a build that predates version tracking; the version is
    /// inferred from the shape of the tables
    Unversioned(u32),
}

/// Brings the schema to `CURRENT_SCHEMA_VERSION`. Running this against a
/// current database changes nothing.
pub fn ensure_schema(conn: &mut Connection) -> Result<(), MapMarkError> {
    let state = detect_schema(conn)?;

    let version = match state {
        SchemaState::Empty => {
            info!("Creating schema version {}", CURRENT_SCHEMA_VERSION);
            let tx = conn.transaction()?;
            create_current_schema(&tx)?;
            set_schema_version(&tx, CURRENT_SCHEMA_VERSION)?;
            tx.commit()?;
            return Ok(());
        }
        SchemaState::Versioned(version) => version,
        SchemaState::Unversioned(version) => {
            info!("Found unversioned database with schema shape {}", version);
            version
        }
    };

    if version == 0 || version > CURRENT_SCHEMA_VERSION {
        return Err(MapMarkError::Error(format!(
            "Unsupported schema version {} (this build supports up to {})",
            version, CURRENT_SCHEMA_VERSION
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.target_version > version) {
        apply_migration(conn, migration)?;
    }

    if state == SchemaState::Unversioned(CURRENT_SCHEMA_VERSION) {
        // The tables match but indexes, the trigger or views may be missing
        let tx = conn.transaction()?;
        create_current_schema(&tx)?;
        set_schema_version(&tx, CURRENT_SCHEMA_VERSION)?;
        tx.commit()?;
    }

    Ok(())
}

pub fn detect_schema(conn: &Connection) -> Result<SchemaState, MapMarkError> {
    if let Some(version) = schema_version(conn)? {
        return Ok(SchemaState::Versioned(version));
    }

    if !table_exists(conn, "markers")? {
        return Ok(SchemaState::Empty);
    }

    let version = if !column_exists(conn, "markers", "value")? {
        1
    } else if !column_exists(conn, "markers", "sufficient_color")? {
        2
    } else if column_exists(conn, "markers", "description")?
        || !column_exists(conn, "images", "mime_type")?
    {
        3
    } else if !table_exists(conn, "visits")? || !table_exists(conn, "user_actions")? {
        4
    } else {
        CURRENT_SCHEMA_VERSION
    };

    Ok(SchemaState::Unversioned(version))
}

/// The stored schema version, or `None` when the database has no `meta`
/// table or no version row.
pub fn schema_version(conn: &Connection) -> Result<Option<u32>, MapMarkError> {
    if !table_exists(conn, "meta")? {
        return Ok(None);
    }

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    stored
        .map(|value| {
            value.trim().parse::<u32>().map_err(|_| {
                MapMarkError::Error(format!("Invalid stored schema version '{}'", value))
            })
        })
        .transpose()
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), MapMarkError> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?)",
        [version.to_string()],
    )?;
    Ok(())
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<(), MapMarkError> {
    info!(
        "Migrating schema to version {}: {}",
        migration.target_version, migration.description
    );

    // Table rebuilds drop tables that other tables reference. Foreign key
    // enforcement can only be toggled outside a transaction, so it is off for
    // the whole step and verified with foreign_key_check before commit.
    conn.pragma_update(None, "foreign_keys", false)?;
    let result = run_migration(conn, migration);
    let restored = conn.pragma_update(None, "foreign_keys", true);

    if let Err(e) = &result {
        warn!(
            "Migration to version {} failed and was rolled back: {}",
            migration.target_version, e
        );
    }
    result?;
    restored?;

    info!("Schema is now at version {}", migration.target_version);
    Ok(())
}

fn run_migration(conn: &mut Connection, migration: &Migration) -> Result<(), MapMarkError> {
    let tx = conn.transaction()?;

    tx.execute_batch(META_TABLE_SQL)?;
    if let Some(sql) = migration.pre_sql {
        tx.execute_batch(sql)?;
    }
    if let Some(code_fn) = migration.code_fn {
        code_fn(&tx)?;
    }
    if let Some(sql) = migration.post_sql {
        tx.execute_batch(sql)?;
    }

    check_foreign_keys(&tx)?;
    set_schema_version(&tx, migration.target_version)?;

    tx.commit()?;
    Ok(())
}

fn check_foreign_keys(conn: &Connection) -> Result<(), MapMarkError> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let violations = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    if violations.is_empty() {
        Ok(())
    } else {
        Err(MapMarkError::Error(format!(
            "Foreign key check failed after migration: {} violation(s) in {}",
            violations.len(),
            violations.join(", ")
        )))
    }
}
