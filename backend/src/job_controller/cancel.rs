//! Cooperative cancellation of uploads.
//!
//! Each active upload owns a `CancellationToken`. Cancelling flips the status in
//! the store first (the store decides who wins against a concurrent finish),
//! then purges queued jobs and trips the token so in-flight workers and the
//! chunker stop before their next commit.

use crate::error::Result;
use crate::job_controller::state::PipelineState;
use common::jobs::UploadStatus;
use log::info;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token of an upload, created on first use.
    pub fn token(&self, upload_id: &str) -> CancellationToken {
        self.lock()
            .entry(upload_id.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, upload_id: &str) -> Option<CancellationToken> {
        self.lock().get(upload_id).cloned()
    }

    /// Fresh token for an upload that is (re)entering the pipeline.
    pub fn renew(&self, upload_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(upload_id.to_string(), token.clone());
        token
    }

    pub fn cancel(&self, upload_id: &str) -> bool {
        match self.lock().get(upload_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_cancelled(&self, upload_id: &str) -> bool {
        self.lock()
            .get(upload_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn release(&self, upload_id: &str) {
        self.lock().remove(upload_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancels a non-terminal upload. Returns `false` when it was already terminal
/// or does not exist.
pub fn cancel_upload(state: &PipelineState, upload_id: &str) -> Result<bool> {
    if !state
        .repo
        .transition(upload_id, &UploadStatus::ACTIVE, UploadStatus::Cancelled)?
    {
        return Ok(false);
    }
    let purged = state.queue.remove_for_upload(upload_id);
    state.tokens.cancel(upload_id);
    info!("upload {} cancelled, {} queued jobs dropped", upload_id, purged);
    state.publish_current(upload_id)?;
    Ok(true)
}
