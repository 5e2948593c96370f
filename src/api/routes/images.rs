use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        rejection::PathRejection,
        Multipart, Path, State,
    },
    Json,
};
use log::info;
use serde::Serialize;

use super::state::{blocking, AppState};
use super::{invalid_path, MessageResponse};
use crate::activity::ActionType;
use crate::api::context::RequestContext;
use crate::error::MapMarkError;
use crate::images::{Image, IncomingFile};
use crate::markers::Marker;

/// Multipart field carrying the uploaded files.
pub const UPLOAD_FIELD: &str = "images";

/// Response structure for a successful upload
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub files: Vec<String>,
}

/// POST /api/markers/{id}/images
///
/// Accepts any number of files under the `images` field. Every file is
/// checked before the first one is written.
pub async fn upload_images(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<i64>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, MapMarkError> {
    let Path(marker_id) = id.map_err(invalid_path)?;
    let mut multipart = multipart.map_err(|e| MapMarkError::InvalidParam(e.body_text()))?;
    let max_file_size = state.uploads.max_file_size();

    // Unknown markers are rejected before any of the body is read
    let db = state.db.clone();
    blocking(move || {
        let conn = db.conn()?;
        if Marker::exists(&conn, marker_id)? {
            Ok(())
        } else {
            Err(MapMarkError::MarkerNotFound(marker_id))
        }
    })
    .await?;

    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        files.push(read_field(field, max_file_size).await?);
    }

    let db = state.db.clone();
    let uploads = state.uploads.clone();
    let images = blocking(move || Image::attach_uploads(&db, &uploads, marker_id, files)).await?;

    for image in &images {
        ctx.record_action(
            &state.db,
            ActionType::UploadImage,
            format!(
                "Uploaded {} ({} bytes, {}) to marker {}",
                image.filename, image.file_size, image.mime_type, marker_id
            ),
            marker_id.to_string(),
        )
        .await;
    }

    info!(
        "[{}] Uploaded {} image(s) to marker {}",
        ctx.request_id,
        images.len(),
        marker_id
    );

    Ok(Json(UploadResponse {
        files: images.into_iter().map(|image| image.filename).collect(),
    }))
}

/// Reads one file field, giving up as soon as it grows past the limit.
async fn read_field(mut field: Field<'_>, max_file_size: u64) -> Result<IncomingFile, MapMarkError> {
    let name = field.file_name().unwrap_or("upload").to_string();

    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(invalid_multipart)? {
        bytes.extend_from_slice(&chunk);
        if bytes.len() as u64 > max_file_size {
            return Err(MapMarkError::FileTooLarge {
                filename: name,
                size: bytes.len() as u64,
                max: max_file_size,
            });
        }
    }

    Ok(IncomingFile { name, bytes })
}

fn invalid_multipart(err: MultipartError) -> MapMarkError {
    MapMarkError::InvalidParam(err.body_text())
}

/// DELETE /api/markers/{id}/images/{filename}
///
/// Only deletes the image if it belongs to marker `id`.
pub async fn delete_image(
    State(state): State<AppState>,
    ctx: RequestContext,
    params: Result<Path<(i64, String)>, PathRejection>,
) -> Result<Json<MessageResponse>, MapMarkError> {
    let Path((marker_id, filename)) = params.map_err(invalid_path)?;

    let db = state.db.clone();
    let uploads = state.uploads.clone();
    let deleted = blocking(move || Image::delete(&db, &uploads, marker_id, &filename)).await?;

    ctx.record_action(
        &state.db,
        ActionType::DeleteImage,
        format!("Deleted image {} from marker {}", deleted, marker_id),
        marker_id.to_string(),
    )
    .await;

    Ok(Json(MessageResponse::new("Image deleted")))
}
