use super::error_response;
use crate::config::Config;
use crate::job_controller::pipeline::{IngestPipeline, SubmitRequest};
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse, Responder};
use futures_util::StreamExt;
use log::{debug, warn};
use serde_json::json;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Text fields longer than this are rejected.
const MAX_FIELD_LEN: usize = 1024;
const DEFAULT_OWNER: &str = "anonymous";

/// A file field saved into the upload directory.
struct ReceivedFile {
    path: PathBuf,
    original_name: String,
    mime_type: String,
}

#[derive(Default)]
struct UploadForm {
    file: Option<ReceivedFile>,
    owner: Option<String>,
    checksum: Option<String>,
    chunk_size: Option<u32>,
}

enum FormError {
    BadRequest(String),
    TooLarge(u64),
    Io(std::io::Error),
}

impl From<std::io::Error> for FormError {
    fn from(e: std::io::Error) -> Self {
        FormError::Io(e)
    }
}

/// HTTP handler: streams the upload to disk and hands it to the pipeline.
///
/// - `202 Accepted` with the snapshot once chunking has started.
/// - `400 Bad Request` for a malformed form or a rejected file.
/// - `413 Payload Too Large` when the file exceeds the configured limit.
pub async fn process(
    payload: Multipart,
    pipeline: web::Data<IngestPipeline>,
    config: web::Data<Config>,
) -> impl Responder {
    let form = match read_form(payload, &config).await {
        Ok(form) => form,
        Err(FormError::BadRequest(msg)) => {
            return HttpResponse::BadRequest().json(json!({ "error": msg }))
        }
        Err(FormError::TooLarge(max)) => {
            return HttpResponse::PayloadTooLarge()
                .json(json!({ "error": format!("file exceeds {} bytes", max) }))
        }
        Err(FormError::Io(e)) => {
            warn!("cannot store upload: {}", e);
            return HttpResponse::ServiceUnavailable()
                .json(json!({ "error": "upload storage unavailable" }));
        }
    };

    let Some(file) = form.file else {
        return HttpResponse::BadRequest().json(json!({ "error": "missing file field" }));
    };
    let request = SubmitRequest {
        file_path: file.path,
        original_name: file.original_name,
        mime_type: file.mime_type,
        owner_id: form.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string()),
        checksum: form.checksum,
        chunk_size: form.chunk_size,
    };

    match pipeline.submit(request).await {
        Ok(snapshot) => HttpResponse::Accepted().json(snapshot),
        Err(e) => error_response(&e),
    }
}

async fn read_form(mut payload: Multipart, config: &Config) -> Result<UploadForm, FormError> {
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| FormError::BadRequest(e.to_string()))?;
        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name().map(|n| n.to_string()));

        match name.as_deref() {
            Some("file") => {
                if form.file.is_some() {
                    return Err(FormError::BadRequest("only one file per upload".to_string()));
                }
                let original_name = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename().map(|f| f.to_string()))
                    .unwrap_or_default();
                let mime_type = field
                    .content_type()
                    .map(|m| m.to_string())
                    .unwrap_or_default();

                // Removed on drop unless handed over to the pipeline.
                let temp = tempfile::Builder::new()
                    .prefix("upload-")
                    .suffix(".csv")
                    .tempfile_in(&config.storage.upload_dir)?;
                let mut written = 0u64;
                {
                    let mut writer = BufWriter::new(temp.as_file());
                    while let Some(chunk) = field.next().await {
                        let chunk = chunk.map_err(|e| FormError::BadRequest(e.to_string()))?;
                        written += chunk.len() as u64;
                        if written > config.pipeline.max_file_size {
                            return Err(FormError::TooLarge(config.pipeline.max_file_size));
                        }
                        writer.write_all(&chunk)?;
                    }
                    writer.flush()?;
                }
                let (_, path) = temp.keep().map_err(|e| FormError::Io(e.error))?;
                debug!("received {} ({} bytes) as {:?}", original_name, written, path);

                form.file = Some(ReceivedFile {
                    path,
                    original_name,
                    mime_type,
                });
            }
            Some("owner") => form.owner = Some(read_text(&mut field).await?),
            Some("checksum") => form.checksum = Some(read_text(&mut field).await?),
            Some("chunk_size") => {
                let text = read_text(&mut field).await?;
                let size = text
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| FormError::BadRequest(format!("invalid chunk_size '{}'", text)))?;
                form.chunk_size = Some(size);
            }
            _ => {
                // Drain unknown fields.
                while let Some(chunk) = field.next().await {
                    chunk.map_err(|e| FormError::BadRequest(e.to_string()))?;
                }
            }
        }
    }

    if let Some(file) = &form.file {
        if form.owner.as_deref().is_some_and(str::is_empty) {
            form.owner = None;
        }
        if form.checksum.as_deref().is_some_and(str::is_empty) {
            form.checksum = None;
        }
        if file.original_name.is_empty() {
            let _ = std::fs::remove_file(&file.path);
            return Err(FormError::BadRequest("file field has no filename".to_string()));
        }
    }
    Ok(form)
}

async fn read_text(field: &mut actix_multipart::Field) -> Result<String, FormError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| FormError::BadRequest(e.to_string()))?;
        if bytes.len() + chunk.len() > MAX_FIELD_LEN {
            return Err(FormError::BadRequest("form field too long".to_string()));
        }
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|_| FormError::BadRequest("form field is not valid UTF-8".to_string()))
}
