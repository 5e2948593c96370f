use log::info;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::db::Database;
use crate::error::MapMarkError;
use crate::markers::Marker;
use crate::upload::{sanitize_filename, StoredFile, UploadStore};

/// An image row. Files live in the upload directory under `filename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    pub id: i64,
    pub marker_id: i64,
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub created_at: Option<String>,
}

/// A file received from the client, not yet validated.
#[derive(Debug)]
pub struct IncomingFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

const IMAGE_COLUMNS: &str =
    "id, marker_id, filename, file_size, mime_type, CAST(created_at AS TEXT)";

impl Image {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Image {
            id: row.get(0)?,
            marker_id: row.get(1)?,
            filename: row.get(2)?,
            file_size: row.get(3)?,
            mime_type: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    /// Records a stored file against `marker_id` and returns the new row.
    pub fn insert(conn: &Connection, marker_id: i64, stored: &StoredFile) -> Result<Self, MapMarkError> {
        let image = conn.query_row(
            &format!(
                "INSERT INTO images (marker_id, filename, file_size, mime_type)
                 VALUES (?, ?, ?, ?)
                 RETURNING {}",
                IMAGE_COLUMNS
            ),
            params![marker_id, stored.filename, stored.file_size as i64, stored.mime_type],
            Image::from_row,
        )?;
        Ok(image)
    }

    pub fn filenames_for_marker(conn: &Connection, marker_id: i64) -> Result<Vec<String>, MapMarkError> {
        let mut stmt = conn.prepare("SELECT filename FROM images WHERE marker_id = ? ORDER BY id")?;
        let filenames = stmt
            .query_map([marker_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(filenames)
    }

    #[cfg(test)]
    pub fn list_for_marker(db: &Database, marker_id: i64) -> Result<Vec<Image>, MapMarkError> {
        let conn = db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM images WHERE marker_id = ? ORDER BY id",
            IMAGE_COLUMNS
        ))?;
        let images = stmt
            .query_map([marker_id], Image::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    /// Validates every file, then writes each one and records its row.
    ///
    /// Nothing is written unless all files pass validation. A file whose row
    /// cannot be inserted is removed again. Files stored before a later
    /// failure stay attached to the marker.
    pub fn attach_uploads(
        db: &Database,
        uploads: &UploadStore,
        marker_id: i64,
        files: Vec<IncomingFile>,
    ) -> Result<Vec<Image>, MapMarkError> {
        let conn = db.conn()?;
        if !Marker::exists(&conn, marker_id)? {
            return Err(MapMarkError::MarkerNotFound(marker_id));
        }

        if files.is_empty() {
            return Err(MapMarkError::InvalidParam(
                "No files uploaded under field 'images'".to_string(),
            ));
        }

        let pending = files
            .into_iter()
            .map(|file| uploads.validate(&file.name, file.bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let mut images = Vec::with_capacity(pending.len());
        for upload in &pending {
            let stored = uploads.store(upload)?;
            let image = match Image::insert(&conn, marker_id, &stored) {
                Ok(image) => image,
                Err(e) => {
                    uploads.remove_best_effort(&stored.filename);
                    return Err(e);
                }
            };
            info!(
                "Stored image {} for marker {} (from '{}', {} bytes)",
                image.filename,
                marker_id,
                upload.original_name(),
                image.file_size
            );
            images.push(image);
        }

        Ok(images)
    }

    /// Deletes image `filename` of marker `marker_id`. Only a row owned by
    /// that marker matches, so another marker's image is reported as not
    /// found. The file is removed before the row deletion commits; a missing
    /// file is fine, any other filesystem error rolls the row back.
    ///
    /// Returns the sanitized filename that was deleted.
    pub fn delete(
        db: &Database,
        uploads: &UploadStore,
        marker_id: i64,
        filename: &str,
    ) -> Result<String, MapMarkError> {
        let not_found = || MapMarkError::ImageNotFound {
            marker_id,
            filename: filename.to_string(),
        };
        let filename = sanitize_filename(filename).ok_or_else(not_found)?;

        let mut conn = db.conn()?;
        Database::immediate_transaction(&mut conn, |tx| {
            let deleted = tx.execute(
                "DELETE FROM images WHERE marker_id = ? AND filename = ?",
                params![marker_id, filename],
            )?;
            if deleted == 0 {
                return Err(not_found());
            }

            uploads.remove(filename)
        })?;

        info!("Deleted image {} of marker {}", filename, marker_id);
        Ok(filename.to_string())
    }
}
