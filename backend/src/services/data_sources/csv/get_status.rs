use super::error_response;
use crate::job_controller::pipeline::IngestPipeline;
use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

pub(crate) async fn process(
    upload_id: web::Path<String>,
    pipeline: web::Data<IngestPipeline>,
) -> impl Responder {
    match pipeline.get_status(&upload_id) {
        Ok(Some(snapshot)) => HttpResponse::Ok().json(snapshot),
        Ok(None) => not_found(&upload_id),
        Err(e) => error_response(&e),
    }
}

pub(crate) async fn progress(
    upload_id: web::Path<String>,
    pipeline: web::Data<IngestPipeline>,
) -> impl Responder {
    match pipeline.get_progress(&upload_id) {
        Ok(Some(report)) => HttpResponse::Ok().json(report),
        Ok(None) => not_found(&upload_id),
        Err(e) => error_response(&e),
    }
}

fn not_found(upload_id: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "error": format!("upload {} not found", upload_id) }))
}
