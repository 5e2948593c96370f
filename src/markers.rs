use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::MapMarkError;
use crate::images::Image;
use crate::upload::UploadStore;

pub const DEFAULT_SUFFICIENT_COLOR: &str = "#409EFF";
pub const DEFAULT_INSUFFICIENT_COLOR: &str = "#F56C6C";

const MARKER_COLUMNS: &str = "id, latitude, longitude, value, required_value,
    sufficient_color, insufficient_color,
    CAST(created_at AS TEXT), CAST(updated_at AS TEXT)";

/// Whether a marker has reached its required value. Never stored; always
/// derived from `value` and `required_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Sufficient,
    Insufficient,
}

impl MarkerStatus {
    pub fn from_values(value: f64, required_value: f64) -> Self {
        if value >= required_value {
            MarkerStatus::Sufficient
        } else {
            MarkerStatus::Insufficient
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerStatus::Sufficient => "sufficient",
            MarkerStatus::Insufficient => "insufficient",
        }
    }
}

/// Client payload for create and update. Update is a full replacement, so
/// omitted optional fields are reset to their defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkerInput {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub required_value: f64,
    #[serde(default)]
    pub sufficient_color: Option<String>,
    #[serde(default)]
    pub insufficient_color: Option<String>,
}

impl MarkerInput {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            value: 0.0,
            required_value: 0.0,
            sufficient_color: None,
            insufficient_color: None,
        }
    }

    pub fn validate(&self) -> Result<(), MapMarkError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(MapMarkError::InvalidParam(format!(
                "latitude must be between -90 and 90, got {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(MapMarkError::InvalidParam(format!(
                "longitude must be between -180 and 180, got {}",
                self.longitude
            )));
        }
        if !self.value.is_finite() || !self.required_value.is_finite() {
            return Err(MapMarkError::InvalidParam(
                "value and required_value must be finite numbers".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sufficient_color(&self) -> &str {
        color_or_default(&self.sufficient_color, DEFAULT_SUFFICIENT_COLOR)
    }

    pub fn insufficient_color(&self) -> &str {
        color_or_default(&self.insufficient_color, DEFAULT_INSUFFICIENT_COLOR)
    }
}

fn color_or_default<'a>(color: &'a Option<String>, default: &'a str) -> &'a str {
    match color.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => c,
        _ => default,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub value: f64,
    pub required_value: f64,
    pub sufficient_color: String,
    pub insufficient_color: String,
    pub status: MarkerStatus,
    pub images: Vec<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Marker {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let value: f64 = row.get(3)?;
        let required_value: f64 = row.get(4)?;
        Ok(Marker {
            id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            value,
            required_value,
            sufficient_color: row.get(5)?,
            insufficient_color: row.get(6)?,
            status: MarkerStatus::from_values(value, required_value),
            images: Vec::new(),
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    pub fn create(db: &Database, input: &MarkerInput) -> Result<Self, MapMarkError> {
        input.validate()?;
        let conn = db.conn()?;

        let id: i64 = conn.query_row(
            "INSERT INTO markers (latitude, longitude, value, required_value,
                                  sufficient_color, insufficient_color)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
            params![
                input.latitude,
                input.longitude,
                input.value,
                input.required_value,
                input.sufficient_color(),
                input.insufficient_color(),
            ],
            |row| row.get(0),
        )?;

        Marker::load(&conn, id)?.ok_or(MapMarkError::MarkerNotFound(id))
    }

    /// Replaces every mutable field of marker `id`.
    pub fn update(db: &Database, id: i64, input: &MarkerInput) -> Result<Self, MapMarkError> {
        input.validate()?;
        let conn = db.conn()?;

        let updated = conn.execute(
            "UPDATE markers
             SET latitude = ?, longitude = ?, value = ?, required_value = ?,
                 sufficient_color = ?, insufficient_color = ?
             WHERE id = ?",
            params![
                input.latitude,
                input.longitude,
                input.value,
                input.required_value,
                input.sufficient_color(),
                input.insufficient_color(),
                id,
            ],
        )?;

        if updated == 0 {
            return Err(MapMarkError::MarkerNotFound(id));
        }

        Marker::load(&conn, id)?.ok_or(MapMarkError::MarkerNotFound(id))
    }

    /// Deletes marker `id` and its image rows in one transaction, then
    /// removes the image files. Returns the filenames that belonged to the
    /// marker. File removal happens after commit and never fails the call.
    pub fn delete(db: &Database, id: i64, uploads: &UploadStore) -> Result<Vec<String>, MapMarkError> {
        let mut conn = db.conn()?;

        let filenames = Database::immediate_transaction(&mut conn, |tx| {
            if !Marker::exists(tx, id)? {
                return Err(MapMarkError::MarkerNotFound(id));
            }

            let filenames = Image::filenames_for_marker(tx, id)?;
            tx.execute("DELETE FROM images WHERE marker_id = ?", [id])?;
            tx.execute("DELETE FROM markers WHERE id = ?", [id])?;
            Ok(filenames)
        })?;

        for filename in &filenames {
            uploads.remove_best_effort(filename);
        }

        Ok(filenames)
    }

    #[cfg(test)]
    pub fn get_by_id(db: &Database, id: i64) -> Result<Option<Self>, MapMarkError> {
        let conn = db.conn()?;
        Marker::load(&conn, id)
    }

    /// Every marker with its image filenames, ordered by id.
    pub fn list_all(db: &Database) -> Result<Vec<Self>, MapMarkError> {
        let conn = db.conn()?;

        let mut images_by_marker: HashMap<i64, Vec<String>> = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT marker_id, filename FROM images ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (marker_id, filename) = row?;
                images_by_marker.entry(marker_id).or_default().push(filename);
            }
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM markers ORDER BY id",
            MARKER_COLUMNS
        ))?;
        let rows = stmt.query_map([], Marker::from_row)?;

        let mut markers = Vec::new();
        for row in rows {
            let mut marker = row?;
            marker.images = images_by_marker.remove(&marker.id).unwrap_or_default();
            markers.push(marker);
        }

        Ok(markers)
    }

    pub fn exists(conn: &Connection, id: i64) -> Result<bool, MapMarkError> {
        let found = conn
            .query_row("SELECT 1 FROM markers WHERE id = ?", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn load(conn: &Connection, id: i64) -> Result<Option<Self>, MapMarkError> {
        let marker = conn
            .query_row(
                &format!("SELECT {} FROM markers WHERE id = ?", MARKER_COLUMNS),
                [id],
                Marker::from_row,
            )
            .optional()?;

        match marker {
            Some(mut marker) => {
                marker.images = Image::filenames_for_marker(conn, id)?;
                Ok(Some(marker))
            }
            None => Ok(None),
        }
    }
}
