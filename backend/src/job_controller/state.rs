//! Shared state of the pipeline and the progress updater.
//!
//! Workers and the chunker never touch upload counters themselves. They push a
//! `ProgressUpdate` into an MPSC channel and `start_progress_updater` applies the
//! updates one at a time against the repository, then mirrors the resulting
//! snapshot into the cache and broadcasts a `ProgressEvent`.
//!
//! - `PipelineState`: clonable handle to every shared component.
//! - `ProgressUpdate`: message sent by workers and the chunking task.
//! - `start_progress_updater`: long-running consumer of those messages.

use crate::error::Result;
use crate::ingest::chunker::ChunkingSummary;
use crate::job_controller::cancel::CancellationRegistry;
use crate::job_controller::queue::{ChunkJob, JobQueue};
use crate::job_controller::retry::{self, RetryPolicy};
use crate::storage::{cache_key, ChunkResolution, SnapshotCache, UploadRepository};
use common::jobs::UploadStatus;
use common::model::upload::UploadJobSnapshot;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Tunables every component reads.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunk_size: u32,
    pub worker_count: usize,
    pub retry: RetryPolicy,
    pub price_tolerance: f64,
    pub cache_ttl: Duration,
    pub completion_timeout: Duration,
}

/// What a worker observed for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// The chunk transaction committed. Row errors were written with it.
    Committed { rows_succeeded: u64, rows_failed: u64 },
    /// The chunk transaction did not commit.
    Failed { reason: String, retryable: bool },
}

#[derive(Debug)]
pub enum ProgressUpdate {
    Chunk {
        upload_id: String,
        chunk_id: String,
        chunk_index: u32,
        outcome: ChunkOutcome,
    },
    ChunkingFinished {
        upload_id: String,
        summary: ChunkingSummary,
    },
    ChunkingFailed {
        upload_id: String,
        reason: String,
    },
    /// Acknowledged once every update sent before it has been applied.
    Flush(oneshot::Sender<()>),
}

/// Broadcast after every applied change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub upload_id: String,
    pub status: UploadStatus,
    pub progress: f64,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl From<&UploadJobSnapshot> for ProgressEvent {
    fn from(snapshot: &UploadJobSnapshot) -> Self {
        ProgressEvent {
            upload_id: snapshot.id.clone(),
            status: snapshot.status,
            progress: snapshot.progress,
            processed_rows: snapshot.processed_rows,
            total_rows: snapshot.total_rows,
            success_count: snapshot.success_count,
            error_count: snapshot.error_count,
        }
    }
}

/// A thread-safe, shareable handle on everything the pipeline's tasks share.
#[derive(Clone)]
pub struct PipelineState {
    pub repo: Arc<dyn UploadRepository>,
    pub cache: Arc<dyn SnapshotCache>,
    pub queue: Arc<JobQueue>,
    pub tokens: Arc<CancellationRegistry>,
    pub settings: Arc<PipelineSettings>,
    pub events: broadcast::Sender<ProgressEvent>,
    /// Sender side of the progress updater's channel.
    pub tx: mpsc::Sender<ProgressUpdate>,
}

impl PipelineState {
    pub fn new(
        repo: Arc<dyn UploadRepository>,
        cache: Arc<dyn SnapshotCache>,
        settings: PipelineSettings,
        channel_capacity: usize,
    ) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let capacity = channel_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let state = PipelineState {
            repo,
            cache,
            queue: Arc::new(JobQueue::new()),
            tokens: Arc::new(CancellationRegistry::default()),
            settings: Arc::new(settings),
            events,
            tx,
        };
        (state, rx)
    }

    /// Mirrors a snapshot into the cache and broadcasts it. A terminal snapshot
    /// also releases the upload's source file and cancellation token.
    pub fn publish(&self, snapshot: &UploadJobSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => {
                if let Err(e) = self
                    .cache
                    .put(&cache_key(&snapshot.id), json, self.settings.cache_ttl)
                {
                    warn!("cache unavailable, snapshot of {} not mirrored: {}", snapshot.id, e);
                }
            }
            Err(e) => warn!("cannot serialize snapshot of {}: {}", snapshot.id, e),
        }
        // No subscribers is fine.
        let _ = self.events.send(ProgressEvent::from(snapshot));

        if snapshot.status.is_terminal() {
            remove_source_file(&snapshot.source_path);
            self.tokens.release(&snapshot.id);
        }
    }

    /// Reloads an upload from the store and publishes it.
    pub fn publish_current(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>> {
        let snapshot = self.repo.get_upload(upload_id)?;
        if let Some(snapshot) = &snapshot {
            self.publish(snapshot);
        }
        Ok(snapshot)
    }

    /// Cached snapshot, falling back to the store when the cache misses or is
    /// unavailable. A store hit repopulates the cache.
    pub fn cached_snapshot(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>> {
        let key = cache_key(upload_id);
        match self.cache.get(&key) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!("dropping unreadable cache entry {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("cache unavailable, reading {} from the store: {}", upload_id, e),
        }

        let snapshot = self.repo.get_upload(upload_id)?;
        if let Some(snapshot) = &snapshot {
            match serde_json::to_string(snapshot) {
                Ok(json) => {
                    if let Err(e) = self.cache.put(&key, json, self.settings.cache_ttl) {
                        debug!("cache still unavailable for {}: {}", key, e);
                    }
                }
                Err(e) => warn!("cannot serialize snapshot of {}: {}", upload_id, e),
            }
        }
        Ok(snapshot)
    }

    /// Fails a non-terminal upload, purges its queued jobs and publishes it.
    /// Returns `false` when the upload was already terminal.
    pub fn fail_upload(&self, upload_id: &str, reasons: &[String]) -> Result<bool> {
        if !self.repo.fail_upload(upload_id, reasons)? {
            return Ok(false);
        }
        let purged = self.queue.remove_for_upload(upload_id);
        warn!(
            "upload {} failed ({} queued jobs dropped): {}",
            upload_id,
            purged,
            reasons.join("; ")
        );
        self.publish_current(upload_id)?;
        Ok(true)
    }
}

pub fn remove_source_file(path: &str) {
    if path.is_empty() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed source file {}", path),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove source file {}: {}", path, e),
    }
}

/// Applies one update. Runs on the blocking pool: every branch talks to the
/// repository synchronously.
pub fn apply_update(state: &PipelineState, update: ProgressUpdate) -> Result<()> {
    match update {
        ProgressUpdate::Chunk {
            upload_id,
            chunk_id,
            chunk_index,
            outcome,
        } => match outcome {
            ChunkOutcome::Committed {
                rows_succeeded,
                rows_failed,
            } => {
                debug!(
                    "chunk {} of {} committed: {} ok, {} rejected",
                    chunk_index, upload_id, rows_succeeded, rows_failed
                );
                if let Some(snapshot) =
                    state
                        .repo
                        .settle_chunk(&upload_id, &chunk_id, ChunkResolution::Completed)?
                {
                    if snapshot.status.is_terminal() {
                        info!(
                            "upload {} finished as {}: {} ok, {} errors",
                            upload_id, snapshot.status, snapshot.success_count, snapshot.error_count
                        );
                    }
                    state.publish(&snapshot);
                }
                Ok(())
            }
            ChunkOutcome::Failed { reason, retryable } => {
                retry::handle_chunk_failure(
                    state,
                    &upload_id,
                    &chunk_id,
                    chunk_index,
                    &reason,
                    retryable,
                )
            }
        },
        ProgressUpdate::ChunkingFinished { upload_id, summary } => {
            info!(
                "upload {} chunked: {} rows in {} chunks",
                upload_id, summary.total_rows, summary.total_chunks
            );
            if let Some(snapshot) = state.repo.finish_chunking(&upload_id)? {
                state.publish(&snapshot);
            }
            Ok(())
        }
        ProgressUpdate::ChunkingFailed { upload_id, reason } => {
            state.fail_upload(&upload_id, &[format!("chunking aborted: {}", reason)])?;
            Ok(())
        }
        ProgressUpdate::Flush(ack) => {
            let _ = ack.send(());
            Ok(())
        }
    }
}

/// Starts the central progress updater.
///
/// Spawned once per pipeline. Updates are applied strictly in arrival order, so
/// counters and the final status of an upload are only ever written from here.
pub async fn start_progress_updater(state: PipelineState, mut rx: mpsc::Receiver<ProgressUpdate>) {
    while let Some(update) = rx.recv().await {
        // Chunk outcomes are re-derivable from the store; keep enough to redeliver.
        let redeliver = match &update {
            ProgressUpdate::Chunk {
                upload_id,
                chunk_id,
                chunk_index,
                ..
            } => Some(ChunkJob::retry(upload_id, chunk_id, *chunk_index, 0)),
            _ => None,
        };

        let worker_state = state.clone();
        let result =
            tokio::task::spawn_blocking(move || apply_update(&worker_state, update)).await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("progress update task panicked: {}", e)),
        };

        if let Some(message) = failure {
            error!("progress update failed: {}", message);
            if let Some(job) = redeliver {
                let delay = state.settings.retry.base_delay;
                if let Err(e) = state.queue.push_delayed(job, delay) {
                    error!("cannot redeliver chunk outcome: {}", e);
                }
            }
        }
    }
    debug!("progress updater stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::MemoryCache;
    use crate::storage::sqlite::SqliteStore;
    use chrono::Utc;
    use common::model::csv::RawRow;
    use common::model::upload::ChunkDescriptor;
    use tempfile::TempDir;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            chunk_size: 2,
            worker_count: 2,
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
            },
            price_tolerance: 0.01,
            cache_ttl: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(5),
        }
    }

    fn state(dir: &TempDir) -> (PipelineState, mpsc::Receiver<ProgressUpdate>) {
        let store = SqliteStore::new(dir.path().join("state.sqlite"), 10);
        store.init().unwrap();
        PipelineState::new(Arc::new(store), Arc::new(MemoryCache::new()), settings(), 16)
    }

    fn chunking_upload(state: &PipelineState, id: &str, source: &str) {
        let snapshot = UploadJobSnapshot {
            id: id.to_string(),
            original_name: "orders.csv".to_string(),
            size: 1,
            checksum: String::new(),
            declared_mime: "text/csv".to_string(),
            detected_mime: "text/csv".to_string(),
            owner_id: "owner".to_string(),
            status: UploadStatus::Chunking,
            progress: 0.0,
            total_rows: 0,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            fatal_errors: Vec::new(),
            retry_count: 0,
            max_retries: 2,
            chunk_size: 2,
            columns: Vec::new(),
            chunks: Vec::new(),
            source_path: source.to_string(),
            start_time: Utc::now(),
            end_time: None,
        };
        state.repo.create_upload(&snapshot).unwrap();
        let chunk = ChunkDescriptor::new(id, 0, 0, 1);
        let rows = vec![RawRow {
            row: 1,
            values: vec!["INV-1".to_string()],
        }];
        state.repo.register_chunk(id, &chunk, &rows).unwrap();
    }

    #[test]
    fn chunking_finished_before_outcome_still_completes() {
        let dir = TempDir::new().unwrap();
        let (state, _rx) = state(&dir);
        let source = dir.path().join("source.csv");
        std::fs::write(&source, "x").unwrap();
        chunking_upload(&state, "u1", source.to_str().unwrap());
        let mut events = state.events.subscribe();

        apply_update(
            &state,
            ProgressUpdate::ChunkingFinished {
                upload_id: "u1".to_string(),
                summary: ChunkingSummary {
                    total_rows: 1,
                    total_chunks: 1,
                },
            },
        )
        .unwrap();
        assert_eq!(events.try_recv().unwrap().status, UploadStatus::Processing);

        state
            .repo
            .commit_chunk("u1", "u1-0", &[], &[])
            .unwrap();
        apply_update(
            &state,
            ProgressUpdate::Chunk {
                upload_id: "u1".to_string(),
                chunk_id: "u1-0".to_string(),
                chunk_index: 0,
                outcome: ChunkOutcome::Committed {
                    rows_succeeded: 0,
                    rows_failed: 0,
                },
            },
        )
        .unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.status, UploadStatus::Completed);
        assert_eq!(event.progress, 100.0);
        assert!(!source.exists());

        let cached = state.cached_snapshot("u1").unwrap().unwrap();
        assert_eq!(cached.status, UploadStatus::Completed);
    }

    #[test]
    fn chunking_failure_fails_the_upload_and_purges_jobs() {
        let dir = TempDir::new().unwrap();
        let (state, _rx) = state(&dir);
        chunking_upload(&state, "u2", "");
        state
            .queue
            .push(ChunkJob::process("u2", "u2-0", 0, Vec::new()))
            .unwrap();

        apply_update(
            &state,
            ProgressUpdate::ChunkingFailed {
                upload_id: "u2".to_string(),
                reason: "invalid utf-8".to_string(),
            },
        )
        .unwrap();

        let snapshot = state.repo.get_upload("u2").unwrap().unwrap();
        assert_eq!(snapshot.status, UploadStatus::Failed);
        assert_eq!(snapshot.fatal_errors, vec!["chunking aborted: invalid utf-8".to_string()]);
        assert_eq!(state.queue.pending_for_upload("u2"), 0);
    }

    #[test]
    fn cached_snapshot_falls_back_to_the_store() {
        let dir = TempDir::new().unwrap();
        let (state, _rx) = state(&dir);
        chunking_upload(&state, "u3", "");

        assert!(state.cache.get(&cache_key("u3")).unwrap().is_none());
        let snapshot = state.cached_snapshot("u3").unwrap().unwrap();
        assert_eq!(snapshot.status, UploadStatus::Chunking);
        assert!(state.cache.get(&cache_key("u3")).unwrap().is_some());
        assert!(state.cached_snapshot("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn flush_is_acknowledged_in_order() {
        let dir = TempDir::new().unwrap();
        let (state, rx) = state(&dir);
        let updater = tokio::spawn(start_progress_updater(state.clone(), rx));

        let (ack, done) = oneshot::channel();
        state.tx.send(ProgressUpdate::Flush(ack)).await.unwrap();
        done.await.unwrap();
        updater.abort();
    }
}
