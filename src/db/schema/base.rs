use rusqlite::Connection;

use crate::error::MapMarkError;

// The DDL below is shared by fresh databases and by the migration steps that
// (re)create the same objects, so a migrated database ends up with exactly
// the schema text a fresh one has.

pub const META_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub const MARKERS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS markers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    value REAL NOT NULL DEFAULT 0,
    required_value REAL NOT NULL DEFAULT 0,
    sufficient_color TEXT NOT NULL DEFAULT '#409EFF',
    insufficient_color TEXT NOT NULL DEFAULT '#F56C6C',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

pub const IMAGES_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    marker_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    mime_type TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (marker_id) REFERENCES markers(id) ON DELETE CASCADE
);
"#;

pub const IMAGES_INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_images_marker_id ON images (marker_id);
"#;

pub const ACTIVITY_TABLES_SQL: &str = r#"
-- Append-only log of inbound requests
CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT,
    user_agent TEXT,
    path TEXT,
    referer TEXT,
    visit_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- Append-only log of successful mutations
CREATE TABLE IF NOT EXISTS user_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT,
    user_agent TEXT,
    action_type TEXT,
    action_detail TEXT,
    target_id TEXT,
    action_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_visits_ip ON visits (ip);
CREATE INDEX IF NOT EXISTS idx_visits_visit_time ON visits (visit_time);
CREATE INDEX IF NOT EXISTS idx_user_actions_ip ON user_actions (ip);
CREATE INDEX IF NOT EXISTS idx_user_actions_action_time ON user_actions (action_time);
CREATE INDEX IF NOT EXISTS idx_user_actions_action_type ON user_actions (action_type);
"#;

pub const MARKER_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_markers_location ON markers (latitude, longitude);
CREATE INDEX IF NOT EXISTS idx_markers_created_at ON markers (created_at);
"#;

pub const MARKER_TRIGGER_SQL: &str = r#"
CREATE TRIGGER IF NOT EXISTS update_markers_updated_at
AFTER UPDATE ON markers
FOR EACH ROW
BEGIN
    UPDATE markers SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;
"#;

pub const VIEWS_SQL: &str = r#"
CREATE VIEW IF NOT EXISTS marker_summary AS
SELECT
    m.id,
    m.latitude,
    m.longitude,
    m.value,
    m.required_value,
    m.created_at,
    m.updated_at,
    COUNT(i.id) AS image_count,
    CASE
        WHEN m.value >= m.required_value THEN 'sufficient'
        ELSE 'insufficient'
    END AS status
FROM markers m
LEFT JOIN images i ON m.id = i.marker_id
GROUP BY m.id;

CREATE VIEW IF NOT EXISTS visit_stats AS
SELECT
    ip,
    user_agent,
    COUNT(*) AS visit_count,
    MAX(visit_time) AS last_visit,
    MIN(visit_time) AS first_visit,
    COUNT(DISTINCT path) AS unique_paths
FROM visits
GROUP BY ip, user_agent;
"#;

/// Creates every table, index, trigger and view of the current schema.
/// The caller owns the transaction and the version bookkeeping.
pub fn create_current_schema(conn: &Connection) -> Result<(), MapMarkError> {
    conn.execute_batch(META_TABLE_SQL)?;
    conn.execute_batch(MARKERS_TABLE_SQL)?;
    conn.execute_batch(IMAGES_TABLE_SQL)?;
    conn.execute_batch(IMAGES_INDEX_SQL)?;
    create_activity_schema(conn)
}

/// Logging tables plus the marker indexes, trigger and views.
pub fn create_activity_schema(conn: &Connection) -> Result<(), MapMarkError> {
    conn.execute_batch(ACTIVITY_TABLES_SQL)?;
    conn.execute_batch(MARKER_INDEXES_SQL)?;
    conn.execute_batch(MARKER_TRIGGER_SQL)?;
    conn.execute_batch(VIEWS_SQL)?;
    Ok(())
}
