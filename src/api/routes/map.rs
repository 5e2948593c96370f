use axum::{
    extract::{RawQuery, State},
    response::Response,
};

use super::state::AppState;
use crate::error::MapMarkError;

/// GET /api/amap-staticmap
///
/// Proxies the static map service. The client's `key` parameter is dropped
/// and the configured key sent instead.
pub async fn static_map(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Response, MapMarkError> {
    state.proxy.forward(query.as_deref()).await
}
