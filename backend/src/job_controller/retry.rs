//! Retry scheduling for failed chunk transactions.
//!
//! A chunk is retried up to `max_retries` times with exponential backoff
//! (`base_delay * backoff_factor^attempt`). After that it is settled as dead and
//! its rows count as errors. Manual retries reopen dead chunks of a finished
//! upload and enqueue them straight away.

use crate::error::Result;
use crate::job_controller::queue::{ChunkJob, MAX_DELAY};
use crate::job_controller::state::PipelineState;
use crate::storage::{ChunkResolution, FailureDecision};
use log::{error, info, warn};
use std::time::Duration;

const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), at most `MAX_DELAY`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.min(MAX_EXPONENT) as i32);
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }
}

/// Decides the fate of a chunk whose transaction failed.
pub fn handle_chunk_failure(
    state: &PipelineState,
    upload_id: &str,
    chunk_id: &str,
    chunk_index: u32,
    reason: &str,
    retryable: bool,
) -> Result<()> {
    let policy = state.settings.retry;
    if retryable {
        match state
            .repo
            .record_chunk_failure(upload_id, chunk_id, policy.max_retries)?
        {
            FailureDecision::Retry { attempt } => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "chunk {} of {} failed ({}), retry {}/{} in {:?}",
                    chunk_index, upload_id, reason, attempt, policy.max_retries, delay
                );
                if let Err(e) = state
                    .queue
                    .push_delayed(ChunkJob::retry(upload_id, chunk_id, chunk_index, attempt), delay)
                {
                    // The chunk stays `retried` and is picked up by recovery.
                    error!("cannot schedule retry of chunk {}: {}", chunk_id, e);
                }
                state.publish_current(upload_id)?;
                return Ok(());
            }
            FailureDecision::Ignored => return Ok(()),
            FailureDecision::Exhausted { attempts } => {
                warn!(
                    "chunk {} of {} failed after {} retries: {}",
                    chunk_index, upload_id, attempts, reason
                );
            }
        }
    } else {
        warn!(
            "chunk {} of {} failed permanently: {}",
            chunk_index, upload_id, reason
        );
    }

    let resolution = ChunkResolution::Dead {
        reason: reason.to_string(),
    };
    if let Some(snapshot) = state.repo.settle_chunk(upload_id, chunk_id, resolution)? {
        if snapshot.status.is_terminal() {
            info!("upload {} finished as {}", upload_id, snapshot.status);
        }
        state.publish(&snapshot);
    }
    Ok(())
}

/// Reopens the dead chunks of a finished upload and enqueues them. Returns how
/// many chunks went back into the queue.
pub fn requeue_failed_chunks(state: &PipelineState, upload_id: &str) -> Result<usize> {
    let reopened = state.repo.reopen_failed_chunks(upload_id)?;
    if reopened.is_empty() {
        return Ok(0);
    }
    state.tokens.renew(upload_id);
    for chunk in &reopened {
        state
            .queue
            .push(ChunkJob::retry(upload_id, &chunk.id, chunk.index, 0))?;
    }
    info!("upload {}: {} chunks queued for manual retry", upload_id, reopened.len());
    state.publish_current(upload_id)?;
    Ok(reopened.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn factor_below_one_never_shrinks_the_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 0.5,
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn huge_attempts_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1000), policy.delay_for(MAX_EXPONENT));
    }

    #[test]
    fn overflowing_delay_is_clamped() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(u64::MAX / 2),
            backoff_factor: 10.0,
        };
        assert_eq!(policy.delay_for(5), MAX_DELAY);
    }
}
