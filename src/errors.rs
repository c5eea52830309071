use crate::services::blob_store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TooLarge { .. } => AppError::bad_request("File too large"),
            StoreError::NotFound(_) => AppError::not_found("File not found"),
            StoreError::Expired(_) => AppError::new(StatusCode::GONE, "File has expired"),
            StoreError::IntegrityFailure(_) => AppError::internal("File integrity check failed"),
            StoreError::WriteFailure(source) => {
                tracing::error!("upload failed: {}", source);
                AppError::internal("Failed to save file")
            }
            StoreError::DeleteFailure { id, source } => {
                tracing::error!("deleting {} failed: {}", id, source);
                AppError::internal("Failed to delete file")
            }
            StoreError::Io(source) => {
                tracing::error!("storage I/O error: {}", source);
                AppError::internal("Storage error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn store_errors_map_to_status_codes() {
        let cases = [
            (
                StoreError::TooLarge { size: 2, limit: 1 },
                StatusCode::BAD_REQUEST,
            ),
            (StoreError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (StoreError::Expired("x".into()), StatusCode::GONE),
            (
                StoreError::IntegrityFailure("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                StoreError::WriteFailure(io::Error::other("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
        assert_eq!(AppError::not_found("gone").status, StatusCode::NOT_FOUND);
    }
}
