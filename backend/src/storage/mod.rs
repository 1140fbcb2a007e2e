//! Pluggable backends behind the pipeline.
//!
//! The durable store (`UploadRepository`) is the source of truth for uploads and
//! chunks. The cache (`SnapshotCache`) only mirrors snapshots for cheap polling and
//! may lose or expire entries at any time.

pub mod cache;
pub mod sqlite;

use crate::error::Result;
use crate::ingest::rows::OrderRecord;
use chrono::{DateTime, Utc};
use common::jobs::UploadStatus;
use common::model::csv::{RawRow, RowValidationError};
use common::model::upload::{ChunkDescriptor, UploadJobSnapshot};
use std::collections::HashSet;
use std::time::Duration;

/// How a chunk leaves the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkResolution {
    /// Rows committed. Counts are read from the commit recorded on the chunk.
    Completed,
    /// Retries exhausted. Every row of the chunk counts as an error.
    Dead { reason: String },
}

/// Result of a chunk transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    /// The chunk had been committed by an earlier delivery; nothing was written.
    pub already_committed: bool,
}

/// What to do with a chunk whose transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Retry as attempt number `attempt` (1-based).
    Retry { attempt: u32 },
    /// Budget spent, the chunk is dead.
    Exhausted { attempts: u32 },
    /// The upload is terminal or the chunk already settled.
    Ignored,
}

/// Durable record of uploads, chunks, row errors and ingested rows.
///
/// Every method is one transaction. Nothing here holds locks across calls, so
/// independent chunks only contend on the backend's own write serialisation.
pub trait UploadRepository: Send + Sync {
    fn create_upload(&self, upload: &UploadJobSnapshot) -> Result<()>;

    fn get_upload(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>>;

    /// Moves the upload to `to` when its current status is one of `from`.
    /// Terminal targets stamp `end_time`. Returns whether the move happened.
    fn transition(&self, upload_id: &str, from: &[UploadStatus], to: UploadStatus)
        -> Result<bool>;

    /// Marks a non-terminal upload `Failed` and records why.
    fn fail_upload(&self, upload_id: &str, reasons: &[String]) -> Result<bool>;

    /// Size, checksum and detected type established by the validator.
    fn set_file_info(
        &self,
        upload_id: &str,
        size: u64,
        checksum: &str,
        detected_mime: &str,
    ) -> Result<()>;

    fn set_columns(&self, upload_id: &str, columns: &[String]) -> Result<()>;

    /// Stores a chunk with its rows and adds them to `total_rows`.
    fn register_chunk(&self, upload_id: &str, chunk: &ChunkDescriptor, rows: &[RawRow])
        -> Result<()>;

    /// `Chunking -> Processing`, completing the upload right away when every
    /// chunk has already settled (or there are none).
    fn finish_chunking(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>>;

    fn chunk_rows(&self, chunk_id: &str) -> Result<Vec<RawRow>>;

    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkDescriptor>>;

    fn mark_chunk_processing(&self, chunk_id: &str) -> Result<()>;

    /// Subset of `keys` already present in the ingested rows.
    fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>>;

    /// Inserts a chunk's valid rows and its row errors in one transaction and
    /// records the counts on the chunk. A chunk is only ever committed once.
    fn commit_chunk(
        &self,
        upload_id: &str,
        chunk_id: &str,
        records: &[OrderRecord],
        rejected: &[RowValidationError],
    ) -> Result<CommitSummary>;

    /// Folds a settled chunk into the upload's counters and progress and applies
    /// the final status once every chunk settled. `None` when the outcome was a
    /// duplicate or the upload is already terminal.
    fn settle_chunk(
        &self,
        upload_id: &str,
        chunk_id: &str,
        resolution: ChunkResolution,
    ) -> Result<Option<UploadJobSnapshot>>;

    fn record_chunk_failure(
        &self,
        upload_id: &str,
        chunk_id: &str,
        max_retries: u32,
    ) -> Result<FailureDecision>;

    /// Puts dead chunks (and, for a `Failed` upload, unfinished ones) back into
    /// play and reopens the upload. Returns the chunks to enqueue.
    fn reopen_failed_chunks(&self, upload_id: &str) -> Result<Vec<ChunkDescriptor>>;

    fn list_by_status(&self, statuses: &[UploadStatus]) -> Result<Vec<String>>;

    /// Non-terminal uploads started before `cutoff`.
    fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Source files still needed by non-terminal uploads.
    fn list_active_sources(&self) -> Result<Vec<String>>;
}

/// Read-optimised mirror of upload snapshots.
pub trait SnapshotCache: Send + Sync {
    fn put(&self, key: &str, json: String, ttl: Duration) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Drops expired entries and returns how many went. Backends that expire
    /// entries on their own keep the default.
    fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Prefix of the fatal reason recorded when an upload misses its deadline.
pub const TIMEOUT_REASON: &str = "TIMEOUT";

pub fn cache_key(upload_id: &str) -> String {
    format!("upload:{}", upload_id)
}
