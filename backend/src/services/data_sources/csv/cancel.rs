use super::error_response;
use crate::job_controller::pipeline::IngestPipeline;
use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

/// `200` when the upload was cancelled, `409` when it had already finished.
pub(crate) async fn process(
    upload_id: web::Path<String>,
    pipeline: web::Data<IngestPipeline>,
) -> impl Responder {
    match pipeline.cancel(&upload_id) {
        Ok(true) => HttpResponse::Ok().json(json!({ "upload_id": *upload_id, "cancelled": true })),
        Ok(false) => HttpResponse::Conflict()
            .json(json!({ "upload_id": *upload_id, "error": "upload already finished" })),
        Err(e) => error_response(&e),
    }
}
