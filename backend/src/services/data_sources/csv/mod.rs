//! HTTP API for order file uploads.
//!
//! Thin adapter over `IngestPipeline`: handlers parse the request, call one
//! pipeline operation and map its result to a response. The pipeline is shared
//! as `web::Data<IngestPipeline>`, the configuration as `web::Data<Config>`.
//!
//! The provided routes are:
//! - `POST /api/uploads`: multipart upload. Expects a `file` field and optional
//!   `owner`, `checksum` (MD5 hex) and `chunk_size` fields. Answers `202` with
//!   the upload snapshot once chunking has started, `400` with the reasons when
//!   the file is rejected.
//! - `GET /api/uploads/{upload_id}`: full snapshot of an upload.
//! - `GET /api/uploads/{upload_id}/progress`: progress, counters, the first row
//!   errors and an estimate of the remaining time.
//! - `POST /api/uploads/{upload_id}/cancel`: cancels a running upload.
//! - `POST /api/uploads/{upload_id}/retry`: re-runs the dead chunks of a
//!   finished upload.

use crate::error::IngestError;
use actix_web::web::{get, post, scope};
use actix_web::{HttpResponse, Scope};
use serde_json::json;

mod cancel;
mod get_status;
mod retry;
mod upload;

const API_PATH: &str = "/api/uploads";

/// Configures and returns the Actix scope for upload routes.
pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("", post().to(upload::process))
        .route("/{upload_id}", get().to(get_status::process))
        .route("/{upload_id}/progress", get().to(get_status::progress))
        .route("/{upload_id}/cancel", post().to(cancel::process))
        .route("/{upload_id}/retry", post().to(retry::process))
}

/// Maps a pipeline error to its HTTP response.
pub(crate) fn error_response(err: &IngestError) -> HttpResponse {
    match err {
        IngestError::FatalValidation { upload_id, reasons } => HttpResponse::BadRequest().json(
            json!({ "upload_id": upload_id, "status": "FAILED", "errors": reasons }),
        ),
        IngestError::NotFound(id) => {
            HttpResponse::NotFound().json(json!({ "error": format!("upload {} not found", id) }))
        }
        IngestError::InvalidState { .. } => {
            HttpResponse::Conflict().json(json!({ "error": err.to_string() }))
        }
        IngestError::Resource(_) => {
            HttpResponse::ServiceUnavailable().json(json!({ "error": err.to_string() }))
        }
        _ => {
            log::error!("request failed: {}", err);
            HttpResponse::InternalServerError().json(json!({ "error": err.to_string() }))
        }
    }
}
