use serde::{Deserialize, Serialize};

/// One data row of an uploaded file, as read by the chunker.
///
/// `values` are positional and line up with the header captured on the upload
/// (`UploadJobSnapshot::columns`). Rows travel inside `process-chunk` jobs and are
/// persisted with their chunk so a retry never has to re-read the source file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RawRow {
    /// 1-based data row number (the header is not counted).
    pub row: u64,
    pub values: Vec<String>,
}

/// A row that failed structural validation, or a row lost to a dead chunk.
///
/// Row errors never fail the chunk they belong to; the row is skipped and the
/// error is kept (up to a per-upload cap) for the user.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RowValidationError {
    /// 1-based data row number.
    pub row: u64,
    /// Column titles the message refers to. Empty for whole-row problems.
    pub fields: Vec<String>,
    pub message: String,
    /// The offending row as it appeared in the file, delimiter-joined.
    pub raw: Option<String>,
}
