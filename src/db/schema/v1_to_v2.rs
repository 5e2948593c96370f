use rusqlite::Connection;

use crate::db::migration::introspect::add_column_if_missing;
use crate::error::MapMarkError;

/// Schema Upgrade: Version 1 → 2
///
/// Adds the measured `value` and the threshold `required_value` to markers.
/// Existing markers get 0 for both, which makes them `sufficient`.
pub fn migrate_1_to_2(conn: &Connection) -> Result<(), MapMarkError> {
    add_column_if_missing(conn, "markers", "value", "REAL DEFAULT 0")?;
    add_column_if_missing(conn, "markers", "required_value", "REAL DEFAULT 0")?;
    Ok(())
}
