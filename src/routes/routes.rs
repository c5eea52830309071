//! Defines routes for the share service.
//!
//! ## Structure
//! - `GET    /`               landing page with the upload form
//! - `POST   /upload`         multipart upload, returns the download link
//! - `GET    /download/{id}`  stream a verified payload
//! - `DELETE /download/{id}`  remove an upload early
//! - `GET    /healthz`, `GET /readyz`  probes

use crate::{
    handlers::{
        file_handlers::{delete_file, download_file, index, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::blob_store::BlobStore,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router carrying `BlobStore` as shared state.
///
/// The upload route disables axum's default body limit; the store enforces
/// its own limit while streaming.
pub fn routes() -> Router<BlobStore> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", get(index))
        .route(
            "/upload",
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/download/{id}", get(download_file).delete(delete_file))
}
