use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    Json,
};
use log::info;

use super::state::{blocking, AppState};
use super::{invalid_json, invalid_path, MessageResponse};
use crate::activity::ActionType;
use crate::api::context::RequestContext;
use crate::error::MapMarkError;
use crate::markers::{Marker, MarkerInput};

/// POST /api/markers
pub async fn create_marker(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<MarkerInput>, JsonRejection>,
) -> Result<Json<Marker>, MapMarkError> {
    let Json(input) = payload.map_err(invalid_json)?;

    let db = state.db.clone();
    let marker = blocking(move || Marker::create(&db, &input)).await?;

    info!("[{}] Created marker {}", ctx.request_id, marker.id);
    ctx.record_action(
        &state.db,
        ActionType::CreateMarker,
        format!(
            "Created marker at ({}, {}) value={} required={} status={}",
            marker.latitude,
            marker.longitude,
            marker.value,
            marker.required_value,
            marker.status.as_str()
        ),
        marker.id.to_string(),
    )
    .await;

    Ok(Json(marker))
}

/// GET /api/markers
pub async fn list_markers(State(state): State<AppState>) -> Result<Json<Vec<Marker>>, MapMarkError> {
    let db = state.db.clone();
    let markers = blocking(move || Marker::list_all(&db)).await?;
    Ok(Json(markers))
}

/// PUT /api/markers/{id}
///
/// Full replacement: optional fields left out of the body go back to their
/// defaults.
pub async fn update_marker(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<MarkerInput>, JsonRejection>,
) -> Result<Json<Marker>, MapMarkError> {
    let Path(id) = id.map_err(invalid_path)?;
    let Json(input) = payload.map_err(invalid_json)?;

    let db = state.db.clone();
    let marker = blocking(move || Marker::update(&db, id, &input)).await?;

    ctx.record_action(
        &state.db,
        ActionType::UpdateMarker,
        format!(
            "Updated marker to ({}, {}) value={} required={} status={}",
            marker.latitude,
            marker.longitude,
            marker.value,
            marker.required_value,
            marker.status.as_str()
        ),
        id.to_string(),
    )
    .await;

    Ok(Json(marker))
}

/// DELETE /api/markers/{id}
///
/// Removes the marker, its image rows and (best-effort) its image files.
pub async fn delete_marker(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<MessageResponse>, MapMarkError> {
    let Path(id) = id.map_err(invalid_path)?;

    let db = state.db.clone();
    let uploads = state.uploads.clone();
    let removed = blocking(move || Marker::delete(&db, id, &uploads)).await?;

    info!(
        "[{}] Deleted marker {} with {} images",
        ctx.request_id,
        id,
        removed.len()
    );
    ctx.record_action(
        &state.db,
        ActionType::DeleteMarker,
        format!("Deleted marker {} and {} images", id, removed.len()),
        id.to_string(),
    )
    .await;

    Ok(Json(MessageResponse::new("Marker deleted")))
}
