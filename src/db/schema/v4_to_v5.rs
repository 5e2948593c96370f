use rusqlite::Connection;

use super::base::create_activity_schema;
use crate::error::MapMarkError;

/// Schema Upgrade: Version 4 → 5
///
/// Adds the `visits` and `user_actions` logs, the marker indexes, the
/// `updated_at` trigger and the `marker_summary` / `visit_stats` views.
/// Everything is `IF NOT EXISTS`: unversioned databases from older builds may
/// already carry the logging tables.
pub fn migrate_4_to_5(conn: &Connection) -> Result<(), MapMarkError> {
    create_activity_schema(conn)
}
