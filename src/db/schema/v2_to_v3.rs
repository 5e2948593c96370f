use rusqlite::Connection;

use crate::db::migration::introspect::add_column_if_missing;
use crate::error::MapMarkError;

/// Schema Upgrade: Version 2 → 3
///
/// Adds per-marker display colors for the two threshold states.
pub fn migrate_2_to_3(conn: &Connection) -> Result<(), MapMarkError> {
    add_column_if_missing(conn, "markers", "sufficient_color", "TEXT DEFAULT '#409EFF'")?;
    add_column_if_missing(conn, "markers", "insufficient_color", "TEXT DEFAULT '#F56C6C'")?;
    Ok(())
}
