use axum::{extract::State, Json};

use super::state::{blocking, AppState};
use crate::activity::{visitor_summaries, VisitorSummary, MAX_VISITOR_GROUPS};
use crate::error::MapMarkError;

/// GET /api/visits
///
/// Visits grouped by client, most recently active first.
pub async fn get_visits(State(state): State<AppState>) -> Result<Json<Vec<VisitorSummary>>, MapMarkError> {
    let db = state.db.clone();
    let summaries = blocking(move || visitor_summaries(&db, MAX_VISITOR_GROUPS)).await?;
    Ok(Json(summaries))
}
