use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one uploaded file.
///
/// `Pending -> Validating -> Chunking -> Processing -> {terminal}`. `Validating`
/// may jump straight to `Failed` when the file is rejected. The four right-hand
/// states never change again, except that `retry` reopens a `PartiallyCompleted`
/// or `Failed` upload back to `Processing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Validating,
    Chunking,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub const TERMINAL: [UploadStatus; 4] = [
        UploadStatus::Completed,
        UploadStatus::PartiallyCompleted,
        UploadStatus::Failed,
        UploadStatus::Cancelled,
    ];

    pub const ACTIVE: [UploadStatus; 4] = [
        UploadStatus::Pending,
        UploadStatus::Validating,
        UploadStatus::Chunking,
        UploadStatus::Processing,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Validating => "VALIDATING",
            UploadStatus::Chunking => "CHUNKING",
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::PartiallyCompleted => "PARTIALLY_COMPLETED",
            UploadStatus::Failed => "FAILED",
            UploadStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(UploadStatus::Pending),
            "VALIDATING" => Ok(UploadStatus::Validating),
            "CHUNKING" => Ok(UploadStatus::Chunking),
            "PROCESSING" => Ok(UploadStatus::Processing),
            "COMPLETED" => Ok(UploadStatus::Completed),
            "PARTIALLY_COMPLETED" => Ok(UploadStatus::PartiallyCompleted),
            "FAILED" => Ok(UploadStatus::Failed),
            "CANCELLED" => Ok(UploadStatus::Cancelled),
            other => Err(format!("unknown upload status '{}'", other)),
        }
    }
}

/// State of one chunk.
///
/// `Failed` is permanent (a dead chunk that exhausted its retries). A chunk that
/// failed transiently and was put back on the queue is `Retried`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retried,
}

impl ChunkStatus {
    /// Settled chunks count towards progress.
    pub fn is_settled(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Retried => "retried",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "processing" => Ok(ChunkStatus::Processing),
            "completed" => Ok(ChunkStatus::Completed),
            "failed" => Ok(ChunkStatus::Failed),
            "retried" => Ok(ChunkStatus::Retried),
            other => Err(format!("unknown chunk status '{}'", other)),
        }
    }
}
