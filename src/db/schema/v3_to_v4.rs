use log::{info, warn};
use rusqlite::Connection;

use super::base::{IMAGES_TABLE_SQL, MARKERS_TABLE_SQL};
use crate::db::migration::introspect::{table_columns, table_exists};
use crate::error::MapMarkError;

// ============================================================================
// Schema Upgrade: Version 3 → 4
//
// Rebuilds `markers` and `images` into their current shape using
// copy-rename-restore: back up the table, drop it, create the new shape, copy
// the rows across (old columns mapped onto new ones, defaults supplied for
// columns that did not exist), drop the backup.
//
// - markers loses `description`, gains NOT NULL defaults and timestamps
// - images gains `file_size`, `mime_type` and a cascading foreign key
//
// The migration runner wraps all three phases in one transaction, so a
// crash part way through leaves the version-3 tables untouched.
// ============================================================================

/// Pre-SQL: the view and trigger reference `markers`; they are recreated by
/// the 4 → 5 step.
pub const UPGRADE_3_TO_4_PRE_SQL: &str = r#"
DROP VIEW IF EXISTS marker_summary;
DROP TRIGGER IF EXISTS update_markers_updated_at;
DROP TABLE IF EXISTS markers_backup;
DROP TABLE IF EXISTS images_backup;
"#;

pub fn migrate_3_to_4(conn: &Connection) -> Result<(), MapMarkError> {
    // images references markers, so it is taken down first
    let had_images = table_exists(conn, "images")?;
    if had_images {
        conn.execute_batch(
            "CREATE TABLE images_backup AS SELECT * FROM images;
             DROP TABLE images;",
        )?;
    }

    rebuild_markers(conn)?;

    conn.execute_batch(IMAGES_TABLE_SQL)?;
    if had_images {
        restore_images(conn)?;
    }

    Ok(())
}

fn rebuild_markers(conn: &Connection) -> Result<(), MapMarkError> {
    conn.execute_batch(
        "CREATE TABLE markers_backup AS SELECT * FROM markers;
         DROP TABLE markers;",
    )?;
    conn.execute_batch(MARKERS_TABLE_SQL)?;

    let old = table_columns(conn, "markers_backup")?;
    if old.iter().any(|c| c == "description") {
        info!("Migration 3→4: dropping markers.description");
    }

    let select = [
        "id".to_string(),
        "latitude".to_string(),
        "longitude".to_string(),
        column_or(&old, "value", "0"),
        column_or(&old, "required_value", "0"),
        text_column_or(&old, "sufficient_color", "'#409EFF'"),
        text_column_or(&old, "insufficient_color", "'#F56C6C'"),
        column_or(&old, "created_at", "CURRENT_TIMESTAMP"),
        column_or(&old, "updated_at", "CURRENT_TIMESTAMP"),
    ];

    let sql = format!(
        "INSERT INTO markers (id, latitude, longitude, value, required_value,
                              sufficient_color, insufficient_color, created_at, updated_at)
         SELECT {} FROM markers_backup",
        select.join(", ")
    );
    let copied = conn.execute(&sql, [])?;

    conn.execute_batch("DROP TABLE markers_backup;")?;
    info!("Migration 3→4: rebuilt markers ({} rows)", copied);

    Ok(())
}

fn restore_images(conn: &Connection) -> Result<(), MapMarkError> {
    let old = table_columns(conn, "images_backup")?;

    let orphans: i64 = conn.query_row(
        "SELECT COUNT(*) FROM images_backup
         WHERE marker_id IS NULL OR marker_id NOT IN (SELECT id FROM markers)",
        [],
        |row| row.get(0),
    )?;
    if orphans > 0 {
        warn!(
            "Migration 3→4: dropping {} image row(s) that reference missing markers",
            orphans
        );
    }

    let select = [
        "id".to_string(),
        "marker_id".to_string(),
        "filename".to_string(),
        column_or(&old, "file_size", "0"),
        column_or(&old, "mime_type", "''"),
        column_or(&old, "created_at", "CURRENT_TIMESTAMP"),
    ];

    let sql = format!(
        "INSERT INTO images (id, marker_id, filename, file_size, mime_type, created_at)
         SELECT {} FROM images_backup
         WHERE marker_id IN (SELECT id FROM markers)",
        select.join(", ")
    );
    let copied = conn.execute(&sql, [])?;

    conn.execute_batch("DROP TABLE images_backup;")?;
    info!("Migration 3→4: rebuilt images ({} rows)", copied);

    Ok(())
}

/// Selects `column` from the backup when it existed, falling back to
/// `default` for absent columns and NULL values.
fn column_or(old_columns: &[String], column: &str, default: &str) -> String {
    if old_columns.iter().any(|c| c == column) {
        format!("COALESCE({}, {})", column, default)
    } else {
        default.to_string()
    }
}

/// Like `column_or`, but an empty string also takes the default.
fn text_column_or(old_columns: &[String], column: &str, default: &str) -> String {
    if old_columns.iter().any(|c| c == column) {
        format!("COALESCE(NULLIF({}, ''), {})", column, default)
    } else {
        default.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_mapping() {
        let old = vec!["id".to_string(), "value".to_string(), "sufficient_color".to_string()];
        assert_eq!(column_or(&old, "value", "0"), "COALESCE(value, 0)");
        assert_eq!(column_or(&old, "required_value", "0"), "0");
        assert_eq!(
            text_column_or(&old, "sufficient_color", "'#409EFF'"),
            "COALESCE(NULLIF(sufficient_color, ''), '#409EFF')"
        );
        assert_eq!(
            text_column_or(&old, "insufficient_color", "'#F56C6C'"),
            "'#F56C6C'"
        );
    }
}
