pub mod images;
pub mod map;
pub mod markers;
pub mod state;
pub mod visits;

use axum::extract::rejection::{JsonRejection, PathRejection};
use serde::Serialize;

use crate::error::MapMarkError;

/// Body of successful delete responses
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Malformed bodies are client errors carrying the parser's message.
pub(crate) fn invalid_json(rejection: JsonRejection) -> MapMarkError {
    MapMarkError::InvalidParam(rejection.body_text())
}

pub(crate) fn invalid_path(rejection: PathRejection) -> MapMarkError {
    MapMarkError::InvalidParam(rejection.body_text())
}
