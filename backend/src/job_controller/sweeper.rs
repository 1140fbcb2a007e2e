//! Periodic cleanup of abandoned work.
//!
//! Each sweep cancels uploads that stayed non-terminal for longer than
//! `stale_after`, deletes files in the upload directory that no active upload
//! references any more and drops expired cache entries.

use crate::error::Result;
use crate::job_controller::cancel::cancel_upload;
use crate::job_controller::state::PipelineState;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub cancelled: usize,
    pub files_removed: usize,
    pub cache_purged: usize,
}

pub struct CleanupSweeper {
    state: PipelineState,
    upload_dir: PathBuf,
    stale_after: Duration,
}

impl CleanupSweeper {
    pub fn new(state: PipelineState, upload_dir: impl AsRef<Path>, stale_after: Duration) -> Self {
        Self {
            state,
            upload_dir: upload_dir.as_ref().to_path_buf(),
            stale_after,
        }
    }

    pub fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let age = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        for upload_id in self.state.repo.list_stale(cutoff)? {
            if cancel_upload(&self.state, &upload_id)? {
                info!("cancelled stale upload {}", upload_id);
                report.cancelled += 1;
            }
        }

        if self.upload_dir.is_dir() {
            report.files_removed = self.remove_orphans()?;
        }
        match self.state.cache.purge_expired() {
            Ok(purged) => report.cache_purged = purged,
            Err(e) => warn!("cache unavailable, expired snapshots kept: {}", e),
        }
        if report != SweepReport::default() {
            info!(
                "sweep: {} stale uploads cancelled, {} orphaned files removed, {} cached snapshots expired",
                report.cancelled, report.files_removed, report.cache_purged
            );
        }
        Ok(report)
    }

    fn remove_orphans(&self) -> Result<usize> {
        let active: HashSet<_> = self
            .state
            .repo
            .list_active_sources()?
            .iter()
            .filter_map(|p| Path::new(p).file_name().map(|n| n.to_os_string()))
            .collect();
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.upload_dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() || active.contains(&entry.file_name()) {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < self.stale_after {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("removed orphaned file {:?}", entry.path());
                    removed += 1;
                }
                Err(e) => warn!("could not remove orphaned file {:?}: {}", entry.path(), e),
            }
        }
        Ok(removed)
    }

    /// Sweeps every `interval` until the task is dropped.
    pub async fn run(self, interval: Duration) {
        let sweeper = std::sync::Arc::new(self);
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let current = sweeper.clone();
            match tokio::task::spawn_blocking(move || current.sweep_once()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("sweep failed: {}", e),
                Err(e) => warn!("sweep task panicked: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_controller::retry::RetryPolicy;
    use crate::job_controller::state::PipelineSettings;
    use crate::storage::cache::MemoryCache;
    use crate::storage::sqlite::SqliteStore;
    use crate::storage::SnapshotCache;
    use common::jobs::UploadStatus;
    use common::model::upload::UploadJobSnapshot;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> PipelineState {
        state_with_cache(dir, Arc::new(MemoryCache::new()))
    }

    fn state_with_cache(dir: &TempDir, cache: Arc<MemoryCache>) -> PipelineState {
        let store = SqliteStore::new(dir.path().join("sweep.sqlite"), 10);
        store.init().unwrap();
        let settings = PipelineSettings {
            chunk_size: 10,
            worker_count: 1,
            retry: RetryPolicy::default(),
            price_tolerance: 0.01,
            cache_ttl: Duration::from_secs(60),
            completion_timeout: Duration::from_secs(5),
        };
        PipelineState::new(Arc::new(store), cache, settings, 8).0
    }

    fn upload(id: &str, status: UploadStatus, source: &Path, age: chrono::Duration) -> UploadJobSnapshot {
        UploadJobSnapshot {
            id: id.to_string(),
            original_name: "orders.csv".to_string(),
            size: 1,
            checksum: String::new(),
            declared_mime: "text/csv".to_string(),
            detected_mime: "text/csv".to_string(),
            owner_id: "owner".to_string(),
            status,
            progress: 0.0,
            total_rows: 0,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            fatal_errors: Vec::new(),
            retry_count: 0,
            max_retries: 3,
            chunk_size: 10,
            columns: Vec::new(),
            chunks: Vec::new(),
            source_path: source.to_string_lossy().into_owned(),
            start_time: Utc::now() - age,
            end_time: None,
        }
    }

    #[test]
    fn cancels_stale_uploads_and_keeps_fresh_ones() {
        let dir = TempDir::new().unwrap();
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let state = state(&dir);

        let stale_file = uploads.join("stale.csv");
        fs::write(&stale_file, "x").unwrap();
        state
            .repo
            .create_upload(&upload("stale", UploadStatus::Processing, &stale_file, chrono::Duration::hours(2)))
            .unwrap();
        let fresh_file = uploads.join("fresh.csv");
        fs::write(&fresh_file, "x").unwrap();
        state
            .repo
            .create_upload(&upload("fresh", UploadStatus::Processing, &fresh_file, chrono::Duration::zero()))
            .unwrap();

        let sweeper = CleanupSweeper::new(state.clone(), &uploads, Duration::from_secs(3600));
        let report = sweeper.sweep_once().unwrap();

        assert_eq!(report.cancelled, 1);
        let stale = state.repo.get_upload("stale").unwrap().unwrap();
        assert_eq!(stale.status, UploadStatus::Cancelled);
        assert!(!stale_file.exists());
        assert!(fresh_file.exists());
    }

    #[test]
    fn removes_unreferenced_files_past_the_age_limit() {
        let dir = TempDir::new().unwrap();
        let uploads = dir.path().join("uploads");
        fs::create_dir_all(&uploads).unwrap();
        let state = state(&dir);

        // Started after the cutoff, so the zero age limit does not make it stale.
        let active_file = uploads.join("active.csv");
        fs::write(&active_file, "x").unwrap();
        state
            .repo
            .create_upload(&upload("active", UploadStatus::Processing, &active_file, chrono::Duration::hours(-1)))
            .unwrap();
        let orphan = uploads.join("orphan.csv");
        fs::write(&orphan, "x").unwrap();

        // Zero age limit: every unreferenced file qualifies.
        let sweeper = CleanupSweeper::new(state, &uploads, Duration::ZERO);
        let report = sweeper.sweep_once().unwrap();

        assert_eq!(report.files_removed, 1);
        assert!(!orphan.exists());
        assert!(active_file.exists());
    }

    #[test]
    fn sweep_evicts_expired_cache_entries() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let state = state_with_cache(&dir, cache.clone());
        for id in ["a", "b", "c"] {
            cache
                .put(&format!("upload:{}", id), "{}".to_string(), Duration::ZERO)
                .unwrap();
        }
        cache
            .put("upload:live", "{}".to_string(), Duration::from_secs(60))
            .unwrap();

        let sweeper = CleanupSweeper::new(state, dir.path().join("missing"), Duration::from_secs(3600));
        let report = sweeper.sweep_once().unwrap();

        assert_eq!(report.cache_purged, 3);
        assert_eq!(cache.len(), 1);
    }
}
