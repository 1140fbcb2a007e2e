use crate::jobs::{ChunkStatus, UploadStatus};
use crate::model::csv::RowValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous range of data rows of one upload, committed as one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// `{upload_id}-{index}`.
    pub id: String,
    pub index: u32,
    /// 0-based offset of the first data row (inclusive).
    pub start_row: u64,
    /// 0-based offset one past the last data row.
    pub end_row: u64,
    pub status: ChunkStatus,
    /// True once the chunk's valid rows are committed to the store.
    pub processed: bool,
    /// Number of failed attempts so far.
    pub attempts: u32,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
}

impl ChunkDescriptor {
    pub fn new(upload_id: &str, index: u32, start_row: u64, end_row: u64) -> Self {
        ChunkDescriptor {
            id: chunk_id(upload_id, index),
            index,
            start_row,
            end_row,
            status: ChunkStatus::Pending,
            processed: false,
            attempts: 0,
            rows_succeeded: 0,
            rows_failed: 0,
        }
    }

    pub fn row_count(&self) -> u64 {
        self.end_row - self.start_row
    }
}

pub fn chunk_id(upload_id: &str, index: u32) -> String {
    format!("{}-{}", upload_id, index)
}

/// Point-in-time view of an upload, as stored in the durable store and mirrored
/// into the cache under `upload:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJobSnapshot {
    pub id: String,
    pub original_name: String,
    pub size: u64,
    /// MD5 of the file contents, lower-case hex.
    pub checksum: String,
    pub declared_mime: String,
    pub detected_mime: String,
    pub owner_id: String,
    pub status: UploadStatus,
    /// 0.0 to 100.0, share of settled chunks.
    pub progress: f64,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub success_count: u64,
    /// Number of rows that were not ingested.
    pub error_count: u64,
    /// Row errors, capped per upload.
    pub errors: Vec<RowValidationError>,
    /// File-level reasons behind a `Failed` status.
    pub fatal_errors: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub chunk_size: u32,
    pub columns: Vec<String>,
    pub chunks: Vec<ChunkDescriptor>,
    pub source_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl UploadJobSnapshot {
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn settled_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.status.is_settled()).count()
    }
}

/// Answer to a progress poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: UploadStatus,
    pub progress: f64,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// At most the first ten row errors.
    pub errors: Vec<RowValidationError>,
    /// Seconds, extrapolated from the rows processed so far.
    pub estimated_time_remaining: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_derived_from_upload_and_index() {
        let chunk = ChunkDescriptor::new("abc", 2, 2000, 2500);
        assert_eq!(chunk.id, "abc-2");
        assert_eq!(chunk.row_count(), 500);
        assert_eq!(chunk.status, ChunkStatus::Pending);
    }
}
