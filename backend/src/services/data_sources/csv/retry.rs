use super::error_response;
use crate::job_controller::pipeline::IngestPipeline;
use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

/// `202` with the number of chunks queued again, `409` when nothing qualifies.
pub(crate) async fn process(
    upload_id: web::Path<String>,
    pipeline: web::Data<IngestPipeline>,
) -> impl Responder {
    match pipeline.retry(&upload_id) {
        Ok(0) => HttpResponse::Conflict()
            .json(json!({ "upload_id": *upload_id, "error": "no failed chunks to retry" })),
        Ok(requeued) => {
            HttpResponse::Accepted().json(json!({ "upload_id": *upload_id, "requeued": requeued }))
        }
        Err(e) => error_response(&e),
    }
}
