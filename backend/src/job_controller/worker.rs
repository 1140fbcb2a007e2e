//! Worker pool consuming chunk jobs.
//!
//! A worker validates the rows of one chunk in parallel, drops duplicates and
//! commits the chunk in a single transaction. It reports the outcome to the
//! progress updater and never touches upload counters directly. Deliveries are
//! at-least-once: a chunk already committed is re-reported from the store
//! instead of being written twice.

use crate::error::{IngestError, Result};
use crate::ingest::rows::{check_rows, split_duplicates, ColumnIndex};
use crate::job_controller::queue::ChunkJob;
use crate::job_controller::state::{ChunkOutcome, PipelineState, ProgressUpdate};
use crate::storage::CommitSummary;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

pub fn spawn_workers(state: &PipelineState, count: usize) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker_id| {
            let state = state.clone();
            tokio::spawn(async move { run_worker(worker_id, state).await })
        })
        .collect()
}

async fn run_worker(worker_id: usize, state: PipelineState) {
    debug!("chunk worker {} started", worker_id);
    while let Some(job) = state.queue.next().await {
        debug!(
            "worker {} took {} for chunk {} of {} (attempt {})",
            worker_id,
            job.kind.as_str(),
            job.chunk_index,
            job.upload_id,
            job.attempt
        );
        if let Some(update) = process_job(&state, job).await {
            if state.tx.send(update).await.is_err() {
                warn!("progress updater gone, worker {} stopping", worker_id);
                break;
            }
        }
    }
    debug!("chunk worker {} stopped", worker_id);
}

/// Runs one job and turns the result into an update for the progress updater.
/// `None` when the job was skipped (cancelled, terminal or already settled).
pub async fn process_job(state: &PipelineState, job: ChunkJob) -> Option<ProgressUpdate> {
    let upload_id = job.upload_id.clone();
    let chunk_id = job.chunk_id.clone();
    let chunk_index = job.chunk_index;

    let worker_state = state.clone();
    let result = tokio::task::spawn_blocking(move || run_chunk(&worker_state, job)).await;
    let outcome = match result {
        Ok(Ok(Some(summary))) => ChunkOutcome::Committed {
            rows_succeeded: summary.rows_succeeded,
            rows_failed: summary.rows_failed,
        },
        Ok(Ok(None)) => return None,
        Ok(Err(e)) => ChunkOutcome::Failed {
            reason: e.to_string(),
            retryable: e.is_retryable(),
        },
        Err(e) => ChunkOutcome::Failed {
            reason: format!("worker panicked: {}", e),
            retryable: true,
        },
    };
    Some(ProgressUpdate::Chunk {
        upload_id,
        chunk_id,
        chunk_index,
        outcome,
    })
}

/// Validates and commits one chunk. Blocking.
pub fn run_chunk(state: &PipelineState, job: ChunkJob) -> Result<Option<CommitSummary>> {
    let token = state.tokens.get(&job.upload_id).unwrap_or_default();
    if token.is_cancelled() {
        return Ok(None);
    }

    let Some(upload) = state.repo.get_upload(&job.upload_id)? else {
        warn!("dropping chunk {} of unknown upload {}", job.chunk_id, job.upload_id);
        return Ok(None);
    };
    if upload.status.is_terminal() {
        debug!("dropping chunk {} of {} upload {}", job.chunk_id, upload.status, upload.id);
        return Ok(None);
    }

    let chunk = state
        .repo
        .get_chunk(&job.chunk_id)?
        .ok_or_else(|| IngestError::NotFound(job.chunk_id.clone()))?;
    if chunk.status.is_settled() {
        return Ok(None);
    }
    if chunk.processed {
        info!("chunk {} of {} was already committed, re-reporting", chunk.index, upload.id);
        return Ok(Some(CommitSummary {
            rows_succeeded: chunk.rows_succeeded,
            rows_failed: chunk.rows_failed,
            already_committed: true,
        }));
    }

    state.repo.mark_chunk_processing(&job.chunk_id)?;
    let rows = if job.rows.is_empty() {
        state.repo.chunk_rows(&job.chunk_id)?
    } else {
        job.rows
    };

    let index = ColumnIndex::new(&upload.columns);
    let checked = check_rows(&rows, &index, state.settings.price_tolerance);
    let keys: Vec<String> = checked
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|record| record.dedupe_key.clone())
        .collect();
    let stored = state.repo.existing_keys(&keys)?;
    let (records, rejected) = split_duplicates(checked, &stored, &rows);

    if token.is_cancelled() {
        debug!("chunk {} of {} cancelled before commit", chunk.index, upload.id);
        return Ok(None);
    }

    let summary = state
        .repo
        .commit_chunk(&job.upload_id, &job.chunk_id, &records, &rejected)?;
    Ok(Some(summary))
}
