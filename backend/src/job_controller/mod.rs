//! Background execution of uploads: the job queue, the worker pool, the progress
//! updater, retries, cancellation and the cleanup sweeper, fronted by
//! `IngestPipeline`.

pub mod cancel;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod state;
pub mod sweeper;
pub mod worker;
