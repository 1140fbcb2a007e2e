//! Error taxonomy of the ingestion pipeline.
//!
//! Row-level problems are not errors here: they are recorded as
//! `common::model::csv::RowValidationError` data and never escalate.

use common::jobs::UploadStatus;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The file was rejected before any chunk was created. Never retried.
    #[error("upload {upload_id} rejected: {}", reasons.join("; "))]
    FatalValidation {
        upload_id: String,
        reasons: Vec<String>,
    },

    /// A chunk transaction failed. Retried by the retry scheduler.
    #[error("chunk processing failed: {0}")]
    ChunkProcessing(String),

    #[error("upload {upload_id} did not finish within {waited:?}")]
    Timeout { upload_id: String, waited: Duration },

    /// Queue, cache or store unavailable.
    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload {upload_id} is {status}, operation not allowed")]
    InvalidState {
        upload_id: String,
        status: UploadStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `csv::Error` already reads "CSV parse error: record …".
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid content pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl IngestError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::ChunkProcessing(_)
                | IngestError::Resource(_)
                | IngestError::Database(_)
                | IngestError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_validation_lists_every_reason() {
        let err = IngestError::FatalValidation {
            upload_id: "u1".to_string(),
            reasons: vec!["too large".to_string(), "bad checksum".to_string()],
        };
        assert_eq!(err.to_string(), "upload u1 rejected: too large; bad checksum");
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_failures_are_retryable() {
        let err = IngestError::from(rusqlite::Error::InvalidQuery);
        assert!(err.is_retryable());
        assert!(IngestError::ChunkProcessing("lost connection".into()).is_retryable());
    }

    #[test]
    fn csv_errors_are_not_prefixed_twice() {
        let bytes: &[u8] = b"a,b\n1,\xff\n";
        let mut reader = csv::Reader::from_reader(bytes);
        let err: IngestError = reader.records().find_map(|r| r.err()).unwrap().into();
        let text = err.to_string();
        assert!(text.starts_with("CSV parse error"), "{}", text);
        assert_eq!(text.matches("CSV parse error").count(), 1, "{}", text);
    }
}
