//! Entry point of the ingestion pipeline.
//!
//! `IngestPipeline` wires validation, chunking, the job queue, the worker pool
//! and the progress updater together and exposes the operations the HTTP layer
//! calls: submit, status, progress, cancel, retry and completion waits.

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::ingest::chunker::{chunk_file, ChunkSink};
use crate::ingest::validator::FileValidator;
use crate::job_controller::cancel::cancel_upload;
use crate::job_controller::queue::{deadline_after, ChunkJob};
use crate::job_controller::retry::{requeue_failed_chunks, RetryPolicy};
use crate::job_controller::state::{
    start_progress_updater, PipelineSettings, PipelineState, ProgressEvent, ProgressUpdate,
};
use crate::job_controller::sweeper::CleanupSweeper;
use crate::job_controller::worker::spawn_workers;
use crate::storage::{SnapshotCache, UploadRepository, TIMEOUT_REASON};
use chrono::Utc;
use common::jobs::UploadStatus;
use common::model::csv::RawRow;
use common::model::upload::{ChunkDescriptor, ProgressReport, UploadJobSnapshot};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors listed by `get_progress`.
const PROGRESS_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub file_path: PathBuf,
    pub original_name: String,
    pub mime_type: String,
    pub owner_id: String,
    /// MD5 the client computed. Without one, the file is trusted as received.
    pub checksum: Option<String>,
    pub chunk_size: Option<u32>,
}

pub struct IngestPipeline {
    state: PipelineState,
    validator: Arc<FileValidator>,
    updates: Mutex<Option<mpsc::Receiver<ProgressUpdate>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Feeds chunks from the chunker into the store and the queue.
struct QueueSink {
    state: PipelineState,
    upload_id: String,
    token: CancellationToken,
}

impl ChunkSink for QueueSink {
    fn columns(&mut self, columns: &[String]) -> Result<()> {
        self.state.repo.set_columns(&self.upload_id, columns)
    }

    fn chunk(&mut self, descriptor: ChunkDescriptor, rows: Vec<RawRow>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(IngestError::InvalidState {
                upload_id: self.upload_id.clone(),
                status: UploadStatus::Cancelled,
            });
        }
        self.state
            .repo
            .register_chunk(&self.upload_id, &descriptor, &rows)?;
        self.state.queue.push(ChunkJob::process(
            &self.upload_id,
            &descriptor.id,
            descriptor.index,
            rows,
        ))
    }
}

impl IngestPipeline {
    pub fn new(
        config: &Config,
        repo: Arc<dyn UploadRepository>,
        cache: Arc<dyn SnapshotCache>,
    ) -> Result<Self> {
        let validator = FileValidator::new(
            config.pipeline.max_file_size,
            config.validation.required_columns.clone(),
            config.validation.allowed_mime_types.clone(),
        )?;
        let settings = PipelineSettings {
            chunk_size: config.pipeline.chunk_size.max(1),
            worker_count: config.pipeline.worker_count.max(1),
            retry: RetryPolicy {
                max_retries: config.pipeline.max_retries,
                base_delay: config.pipeline.retry_base_delay(),
                backoff_factor: config.pipeline.backoff_factor,
            },
            price_tolerance: config.validation.price_tolerance,
            cache_ttl: config.cache.ttl(),
            completion_timeout: config.pipeline.completion_timeout(),
        };
        let (state, rx) =
            PipelineState::new(repo, cache, settings, config.pipeline.channel_capacity);
        Ok(IngestPipeline {
            state,
            validator: Arc::new(validator),
            updates: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Spawns the progress updater and the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let rx = match self.updates.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(rx) = rx else {
            return;
        };

        let mut handles = vec![tokio::spawn(start_progress_updater(self.state.clone(), rx))];
        handles.extend(spawn_workers(&self.state, self.state.settings.worker_count));
        info!(
            "ingest pipeline started with {} workers",
            self.state.settings.worker_count
        );
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
    }

    /// Stops the workers, waits for pending progress updates and stops the updater.
    /// Queued jobs stay recoverable from the store.
    pub async fn shutdown(&self) {
        self.state.queue.close();
        let mut handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        if handles.is_empty() {
            return;
        }
        let updater = handles.remove(0);
        for worker in handles {
            if let Err(e) = worker.await {
                warn!("worker ended abnormally: {}", e);
            }
        }
        self.flush().await;
        updater.abort();
        info!(
            "ingest pipeline stopped, {} queued jobs left for recovery",
            self.state.queue.len()
        );
    }

    /// Waits until every update sent so far has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.state.tx.send(ProgressUpdate::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Registers, validates and starts chunking an uploaded file. Returns once
    /// chunking has started; processing continues in the background.
    pub async fn submit(&self, request: SubmitRequest) -> Result<UploadJobSnapshot> {
        if self.state.queue.is_closed() {
            return Err(IngestError::Resource("pipeline is shut down".to_string()));
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        let chunk_size = request
            .chunk_size
            .filter(|size| *size > 0)
            .unwrap_or(self.state.settings.chunk_size);
        let upload = UploadJobSnapshot {
            id: upload_id.clone(),
            original_name: request.original_name.clone(),
            size: 0,
            checksum: request.checksum.clone().unwrap_or_default(),
            declared_mime: request.mime_type.clone(),
            detected_mime: String::new(),
            owner_id: request.owner_id.clone(),
            status: UploadStatus::Pending,
            progress: 0.0,
            total_rows: 0,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            fatal_errors: Vec::new(),
            retry_count: 0,
            max_retries: self.state.settings.retry.max_retries,
            chunk_size,
            columns: Vec::new(),
            chunks: Vec::new(),
            source_path: request.file_path.to_string_lossy().into_owned(),
            start_time: Utc::now(),
            end_time: None,
        };
        self.state
            .repo
            .create_upload(&upload)
            .map_err(|e| IngestError::Resource(format!("cannot register upload: {}", e)))?;
        info!(
            "upload {} registered: {} from {}",
            upload_id, request.original_name, request.owner_id
        );
        // Exists before anyone can see the upload, so every cancel trips it.
        let token = self.state.tokens.renew(&upload_id);

        self.state.repo.transition(
            &upload_id,
            &[UploadStatus::Pending],
            UploadStatus::Validating,
        )?;
        self.state.publish_current(&upload_id)?;

        let validator = self.validator.clone();
        let path = request.file_path.clone();
        let declared_checksum = request.checksum.clone();
        let declared_mime = request.mime_type.clone();
        let original_name = request.original_name.clone();
        let report = tokio::task::spawn_blocking(move || {
            validator.validate(
                &path,
                declared_checksum.as_deref(),
                &declared_mime,
                &original_name,
            )
        })
        .await
        .map_err(|e| IngestError::Resource(format!("validation task failed: {}", e)))?;

        self.state.repo.set_file_info(
            &upload_id,
            report.size,
            &report.checksum,
            &report.detected_mime,
        )?;

        if !report.valid {
            let reasons = report.reasons();
            self.state.fail_upload(&upload_id, &reasons)?;
            return Err(IngestError::FatalValidation { upload_id, reasons });
        }

        if !self.state.repo.transition(
            &upload_id,
            &[UploadStatus::Validating],
            UploadStatus::Chunking,
        )? {
            let status = self.status_of(&upload_id)?;
            return Err(IngestError::InvalidState { upload_id, status });
        }
        let snapshot = self
            .state
            .publish_current(&upload_id)?
            .ok_or_else(|| IngestError::NotFound(upload_id.clone()))?;
        if snapshot.status.is_terminal() || token.is_cancelled() {
            return Ok(snapshot);
        }

        self.spawn_chunking(&upload_id, request.file_path, chunk_size, token);
        self.spawn_supervisor(&upload_id, self.state.settings.completion_timeout);
        Ok(snapshot)
    }

    fn spawn_chunking(
        &self,
        upload_id: &str,
        path: PathBuf,
        chunk_size: u32,
        token: CancellationToken,
    ) {
        let state = self.state.clone();
        let upload_id = upload_id.to_string();
        tokio::spawn(async move {
            let mut sink = QueueSink {
                state: state.clone(),
                upload_id: upload_id.clone(),
                token,
            };
            let id = upload_id.clone();
            let result =
                tokio::task::spawn_blocking(move || chunk_file(&path, &id, chunk_size, &mut sink))
                    .await;
            let update = match result {
                Ok(Ok(summary)) => ProgressUpdate::ChunkingFinished {
                    upload_id: upload_id.clone(),
                    summary,
                },
                Ok(Err(e)) => ProgressUpdate::ChunkingFailed {
                    upload_id: upload_id.clone(),
                    reason: e.to_string(),
                },
                Err(e) => ProgressUpdate::ChunkingFailed {
                    upload_id: upload_id.clone(),
                    reason: format!("chunking task panicked: {}", e),
                },
            };
            if state.tx.send(update).await.is_err() {
                error!("progress updater gone, chunking result of {} lost", upload_id);
            }
        });
    }

    /// Fails the upload if it is still running after `timeout`.
    fn spawn_supervisor(&self, upload_id: &str, timeout: Duration) {
        let state = self.state.clone();
        let upload_id = upload_id.to_string();
        tokio::spawn(async move {
            match await_terminal(&state, &upload_id, timeout).await {
                Ok(snapshot) => debug!("upload {} settled as {}", upload_id, snapshot.status),
                Err(IngestError::Timeout { .. }) => {}
                Err(e) => warn!("supervisor of {} stopped: {}", upload_id, e),
            }
        });
    }

    fn status_of(&self, upload_id: &str) -> Result<UploadStatus> {
        self.state
            .repo
            .get_upload(upload_id)?
            .map(|u| u.status)
            .ok_or_else(|| IngestError::NotFound(upload_id.to_string()))
    }

    /// Latest snapshot, served from the cache when possible.
    pub fn get_status(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>> {
        self.state.cached_snapshot(upload_id)
    }

    pub fn get_progress(&self, upload_id: &str) -> Result<Option<ProgressReport>> {
        Ok(self.get_status(upload_id)?.map(|snapshot| progress_report(&snapshot)))
    }

    /// Cancels a non-terminal upload. `Ok(false)` when it had already finished.
    pub fn cancel(&self, upload_id: &str) -> Result<bool> {
        if self.state.repo.get_upload(upload_id)?.is_none() {
            return Err(IngestError::NotFound(upload_id.to_string()));
        }
        cancel_upload(&self.state, upload_id)
    }

    /// Re-runs the dead chunks of a finished upload. Only `PARTIALLY_COMPLETED`
    /// and `FAILED` uploads with chunks qualify.
    pub fn retry(&self, upload_id: &str) -> Result<usize> {
        let requeued = requeue_failed_chunks(&self.state, upload_id)?;
        if requeued > 0 {
            self.spawn_supervisor(upload_id, self.state.settings.completion_timeout);
        }
        Ok(requeued)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.state.events.subscribe()
    }

    /// Resolves with the terminal snapshot, or fails the upload with a timeout.
    pub async fn wait_for_completion(
        &self,
        upload_id: &str,
        timeout: Duration,
    ) -> Result<UploadJobSnapshot> {
        await_terminal(&self.state, upload_id, timeout).await
    }

    /// Picks up uploads left behind by a previous process.
    ///
    /// Uploads that were still being validated or chunked cannot be resumed and
    /// are failed. Uploads in `PROCESSING` get their unsettled chunks queued again.
    pub fn recover(&self) -> Result<usize> {
        for upload_id in self.state.repo.list_by_status(&[
            UploadStatus::Pending,
            UploadStatus::Validating,
            UploadStatus::Chunking,
        ])? {
            self.state
                .fail_upload(&upload_id, &["interrupted by restart before chunking finished".to_string()])?;
        }

        let mut requeued = 0;
        for upload_id in self.state.repo.list_by_status(&[UploadStatus::Processing])? {
            let Some(upload) = self.state.repo.get_upload(&upload_id)? else {
                continue;
            };
            self.state.tokens.renew(&upload_id);
            for chunk in upload.chunks.iter().filter(|c| !c.status.is_settled()) {
                self.state.queue.push(ChunkJob::retry(
                    &upload_id,
                    &chunk.id,
                    chunk.index,
                    chunk.attempts,
                ))?;
                requeued += 1;
            }
            let elapsed = (Utc::now() - upload.start_time).to_std().unwrap_or_default();
            let remaining = self
                .state
                .settings
                .completion_timeout
                .saturating_sub(elapsed)
                .max(Duration::from_millis(1));
            self.spawn_supervisor(&upload_id, remaining);
        }
        if requeued > 0 {
            info!("recovered {} chunks from a previous run", requeued);
        }
        Ok(requeued)
    }

    pub fn sweeper(&self, upload_dir: &Path, stale_after: Duration) -> CleanupSweeper {
        CleanupSweeper::new(self.state.clone(), upload_dir, stale_after)
    }
}

/// Builds the polling view of a snapshot.
pub fn progress_report(snapshot: &UploadJobSnapshot) -> ProgressReport {
    let estimated_time_remaining = if snapshot.status.is_terminal() {
        Some(0)
    } else if snapshot.processed_rows > 0 && snapshot.total_rows > snapshot.processed_rows {
        let elapsed = (Utc::now() - snapshot.start_time).num_milliseconds().max(0) as f64;
        let per_row = elapsed / snapshot.processed_rows as f64;
        let remaining = (snapshot.total_rows - snapshot.processed_rows) as f64;
        Some((per_row * remaining / 1000.0).ceil() as u64)
    } else {
        None
    };
    ProgressReport {
        status: snapshot.status,
        progress: snapshot.progress,
        processed_rows: snapshot.processed_rows,
        total_rows: snapshot.total_rows,
        success_count: snapshot.success_count,
        error_count: snapshot.error_count,
        errors: snapshot
            .errors
            .iter()
            .take(PROGRESS_ERROR_LIMIT)
            .cloned()
            .collect(),
        estimated_time_remaining,
    }
}

async fn await_terminal(
    state: &PipelineState,
    upload_id: &str,
    timeout: Duration,
) -> Result<UploadJobSnapshot> {
    // Subscribe before the first read so no transition slips between them.
    let mut events = state.events.subscribe();
    let deadline = deadline_after(timeout);
    loop {
        let snapshot = state
            .repo
            .get_upload(upload_id)?
            .ok_or_else(|| IngestError::NotFound(upload_id.to_string()))?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }

        if tokio::time::timeout_at(deadline, next_event_for(&mut events, upload_id))
            .await
            .is_err()
        {
            let reason = format!(
                "{}: processing did not finish within {}s",
                TIMEOUT_REASON,
                timeout.as_secs_f64()
            );
            if state.fail_upload(upload_id, &[reason])? {
                return Err(IngestError::Timeout {
                    upload_id: upload_id.to_string(),
                    waited: timeout,
                });
            }
            // Finished at the deadline; the next read returns it.
        }
    }
}

async fn next_event_for(events: &mut broadcast::Receiver<ProgressEvent>, upload_id: &str) {
    loop {
        match events.recv().await {
            Ok(event) if event.upload_id == upload_id => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use common::model::csv::RowValidationError;

    fn snapshot(status: UploadStatus, processed: u64, total: u64) -> UploadJobSnapshot {
        UploadJobSnapshot {
            id: "p".to_string(),
            original_name: "orders.csv".to_string(),
            size: 1,
            checksum: String::new(),
            declared_mime: "text/csv".to_string(),
            detected_mime: "text/csv".to_string(),
            owner_id: "owner".to_string(),
            status,
            progress: 50.0,
            total_rows: total,
            processed_rows: processed,
            success_count: processed,
            error_count: 0,
            errors: (1..=15)
                .map(|row| RowValidationError {
                    row,
                    fields: Vec::new(),
                    message: "bad".to_string(),
                    raw: None,
                })
                .collect(),
            fatal_errors: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            chunk_size: 10,
            columns: Vec::new(),
            chunks: Vec::new(),
            source_path: String::new(),
            start_time: Utc::now() - ChronoDuration::seconds(10),
            end_time: None,
        }
    }

    #[test]
    fn progress_report_lists_first_ten_errors() {
        let report = progress_report(&snapshot(UploadStatus::Processing, 50, 100));
        assert_eq!(report.errors.len(), PROGRESS_ERROR_LIMIT);
        assert_eq!(report.errors[0].row, 1);
    }

    #[test]
    fn eta_extrapolates_elapsed_time_per_row() {
        let report = progress_report(&snapshot(UploadStatus::Processing, 50, 100));
        let eta = report.estimated_time_remaining.unwrap();
        assert!((10..=11).contains(&eta), "eta was {}", eta);

        assert_eq!(
            progress_report(&snapshot(UploadStatus::Processing, 0, 100)).estimated_time_remaining,
            None
        );
        assert_eq!(
            progress_report(&snapshot(UploadStatus::Completed, 100, 100)).estimated_time_remaining,
            Some(0)
        );
    }
}
