use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use rusqlite::Error as RusqliteError;
use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapMarkError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Upstream request failed: {0}")]
    UpstreamError(#[from] reqwest::Error),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Marker {0} not found")]
    MarkerNotFound(i64),

    #[error("Image '{filename}' not found for marker {marker_id}")]
    ImageNotFound { marker_id: i64, filename: String },

    #[error("File '{filename}' is {size} bytes, the limit is {max} bytes")]
    FileTooLarge { filename: String, size: u64, max: u64 },

    #[error("Unsupported file type for '{0}'")]
    InvalidFileType(String),

    #[error("Error: {0}")]
    Error(String),
}

/// Numeric error codes. The values are part of the JSON error contract the
/// front end already understands and must not be renumbered.
pub mod codes {
    pub const INTERNAL: u32 = 1000;
    pub const DATABASE: u32 = 1001;
    pub const FILE_SYSTEM: u32 = 1002;
    pub const INVALID_PARAM: u32 = 2003;
    pub const MARKER_NOT_FOUND: u32 = 2004;
    pub const IMAGE_NOT_FOUND: u32 = 2005;
    pub const INVALID_FILE_TYPE: u32 = 3007;
    pub const FILE_TOO_LARGE: u32 = 3008;
}

impl MapMarkError {
    pub fn code(&self) -> u32 {
        match self {
            MapMarkError::InvalidParam(_) => codes::INVALID_PARAM,
            MapMarkError::MarkerNotFound(_) => codes::MARKER_NOT_FOUND,
            MapMarkError::ImageNotFound { .. } => codes::IMAGE_NOT_FOUND,
            MapMarkError::InvalidFileType(_) => codes::INVALID_FILE_TYPE,
            MapMarkError::FileTooLarge { .. } => codes::FILE_TOO_LARGE,
            MapMarkError::DatabaseError(_) | MapMarkError::PoolError(_) => codes::DATABASE,
            MapMarkError::IoError(_) => codes::FILE_SYSTEM,
            _ => codes::INTERNAL,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            MapMarkError::InvalidParam(_)
            | MapMarkError::InvalidFileType(_)
            | MapMarkError::FileTooLarge { .. } => StatusCode::BAD_REQUEST,
            MapMarkError::MarkerNotFound(_) | MapMarkError::ImageNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Server-side failures are reduced to a
    /// generic text; the full error only goes to the log.
    fn public_message(&self) -> String {
        match self {
            MapMarkError::DatabaseError(_) | MapMarkError::PoolError(_) => {
                "Database operation failed".to_string()
            }
            MapMarkError::IoError(_) => "File system operation failed".to_string(),
            MapMarkError::UpstreamError(_) => "Map service request failed".to_string(),
            e if e.status().is_server_error() => "Internal server error".to_string(),
            e => e.to_string(),
        }
    }
}

/// Error response structure returned by every API endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u32,
}

impl IntoResponse for MapMarkError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: self.public_message(),
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}
