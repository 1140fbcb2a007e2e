//! In-process job queue shared by the chunker and the worker pool.
//!
//! Jobs are delivered at least once. A job can be ready immediately or become
//! ready after a delay (retries). Workers pull with `next()`, which parks on a
//! `Notify` and re-checks at least every `IDLE_POLL` so delayed jobs and
//! `close()` are noticed without a dedicated timer task.

use crate::error::{IngestError, Result};
use common::model::csv::RawRow;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const IDLE_POLL: Duration = Duration::from_millis(250);

/// Longest delay or deadline the pipeline schedules; larger values are clamped.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + delay`, clamped so it cannot overflow `Instant`.
pub fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ProcessChunk,
    RetryChunk,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessChunk => "process-chunk",
            JobKind::RetryChunk => "retry-chunk",
        }
    }
}

/// One unit of work: a chunk of one upload.
///
/// Jobs built by the chunker carry their rows. Retry and recovery jobs carry
/// none and the worker loads the persisted rows instead.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub kind: JobKind,
    pub upload_id: String,
    pub chunk_id: String,
    pub chunk_index: u32,
    pub rows: Vec<RawRow>,
    pub attempt: u32,
}

impl ChunkJob {
    pub fn process(upload_id: &str, chunk_id: &str, chunk_index: u32, rows: Vec<RawRow>) -> Self {
        Self {
            kind: JobKind::ProcessChunk,
            upload_id: upload_id.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_index,
            rows,
            attempt: 0,
        }
    }

    pub fn retry(upload_id: &str, chunk_id: &str, chunk_index: u32, attempt: u32) -> Self {
        Self {
            kind: JobKind::RetryChunk,
            upload_id: upload_id.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_index,
            rows: Vec::new(),
            attempt,
        }
    }
}

struct Delayed {
    ready_at: Instant,
    job: ChunkJob,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ChunkJob>,
    delayed: Vec<Delayed>,
    closed: bool,
}

enum Take {
    Job(ChunkJob),
    Wait(Option<Instant>),
    Closed,
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock leaves plain collections behind, still usable.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, job: ChunkJob) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(IngestError::Resource("job queue is closed".to_string()));
            }
            state.ready.push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn push_delayed(&self, job: ChunkJob, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self.push(job);
        }
        {
            let mut state = self.lock();
            if state.closed {
                return Err(IngestError::Resource("job queue is closed".to_string()));
            }
            state.delayed.push(Delayed {
                ready_at: deadline_after(delay),
                job,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Drops every queued job of an upload, ready or delayed.
    pub fn remove_for_upload(&self, upload_id: &str) -> usize {
        let mut state = self.lock();
        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|job| job.upload_id != upload_id);
        state.delayed.retain(|d| d.job.upload_id != upload_id);
        before - state.ready.len() - state.delayed.len()
    }

    pub fn pending_for_upload(&self, upload_id: &str) -> usize {
        let state = self.lock();
        state.ready.iter().filter(|job| job.upload_id == upload_id).count()
            + state.delayed.iter().filter(|d| d.job.upload_id == upload_id).count()
    }

    /// Jobs waiting, ready or delayed.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Stops accepting jobs. Workers see `None` from `next()` and exit; whatever
    /// is still queued is recovered from the store on the next start.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn try_take(&self) -> Take {
        let mut state = self.lock();
        if state.closed {
            return Take::Closed;
        }

        let now = Instant::now();
        if !state.delayed.is_empty() {
            let (mut due, waiting): (Vec<Delayed>, Vec<Delayed>) = state
                .delayed
                .drain(..)
                .partition(|d| d.ready_at <= now);
            state.delayed = waiting;
            due.sort_by_key(|d| d.ready_at);
            state.ready.extend(due.into_iter().map(|d| d.job));
        }

        match state.ready.pop_front() {
            Some(job) => Take::Job(job),
            None => Take::Wait(state.delayed.iter().map(|d| d.ready_at).min()),
        }
    }

    /// Waits for the next ready job. `None` once the queue is closed.
    pub async fn next(&self) -> Option<ChunkJob> {
        loop {
            let notified = self.notify.notified();
            match self.try_take() {
                Take::Job(job) => return Some(job),
                Take::Closed => return None,
                Take::Wait(deadline) => {
                    let wait = deadline
                        .map(|at| at.saturating_duration_since(Instant::now()))
                        .unwrap_or(IDLE_POLL)
                        .min(IDLE_POLL);
                    let _ = tokio::time::timeout(wait, notified).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(upload: &str, index: u32) -> ChunkJob {
        ChunkJob::process(upload, &format!("{}-{}", upload, index), index, Vec::new())
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = JobQueue::new();
        queue.push(job("a", 0)).unwrap();
        queue.push(job("a", 1)).unwrap();

        assert_eq!(queue.next().await.unwrap().chunk_index, 0);
        assert_eq!(queue.next().await.unwrap().chunk_index, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_jobs_wait_for_their_deadline() {
        let queue = JobQueue::new();
        queue
            .push_delayed(ChunkJob::retry("a", "a-0", 0, 1), Duration::from_secs(2))
            .unwrap();
        queue.push(job("b", 0)).unwrap();

        let first = queue.next().await.unwrap();
        assert_eq!(first.upload_id, "b");

        let started = Instant::now();
        let retry = queue.next().await.unwrap();
        assert_eq!(retry.kind, JobKind::RetryChunk);
        assert_eq!(retry.attempt, 1);
        assert!(started.elapsed() >= Duration::from_secs(2) - Duration::from_millis(1));
    }

    #[tokio::test]
    async fn oversized_delay_is_clamped() {
        let queue = JobQueue::new();
        queue
            .push_delayed(ChunkJob::retry("a", "a-0", 0, 1), Duration::MAX)
            .unwrap();

        assert_eq!(queue.len(), 1);
        assert!(deadline_after(Duration::MAX) > Instant::now());
        assert!(tokio::time::timeout(Duration::from_millis(20), queue.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_for_upload_purges_ready_and_delayed() {
        let queue = JobQueue::new();
        queue.push(job("a", 0)).unwrap();
        queue.push(job("b", 0)).unwrap();
        queue
            .push_delayed(ChunkJob::retry("a", "a-1", 1, 1), Duration::from_secs(60))
            .unwrap();

        assert_eq!(queue.pending_for_upload("a"), 2);
        assert_eq!(queue.remove_for_upload("a"), 2);
        assert_eq!(queue.pending_for_upload("a"), 0);
        assert_eq!(queue.next().await.unwrap().upload_id, "b");
    }

    #[tokio::test]
    async fn close_wakes_waiting_workers() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.close();

        assert!(waiter.await.unwrap().is_none());
        assert!(queue.push(job("a", 0)).is_err());
    }
}
