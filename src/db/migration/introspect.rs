use rusqlite::Connection;

use crate::error::MapMarkError;

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, MapMarkError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of `table`, in declaration order. Empty if the table does
/// not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, MapMarkError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?)")?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, MapMarkError> {
    Ok(table_columns(conn, table)?.iter().any(|c| c == column))
}

/// Non-destructive `ALTER TABLE ... ADD COLUMN`, skipped when the column is
/// already there. Returns whether the column was added.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<bool, MapMarkError> {
    if column_exists(conn, table, column)? {
        return Ok(false);
    }

    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {};",
        table, column, definition
    ))?;
    log::info!("Added column {}.{}", table, column);

    Ok(true)
}
