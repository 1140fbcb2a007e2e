//! SQLite implementation of `UploadRepository`.
//!
//! A connection is opened per operation, the same way the request handlers open
//! `Connection::open` per call. WAL mode plus a busy timeout lets workers on
//! different chunks write concurrently without any lock of our own.

use crate::error::{IngestError, Result};
use crate::ingest::rows::OrderRecord;
use crate::storage::{
    ChunkResolution, CommitSummary, FailureDecision, UploadRepository, TIMEOUT_REASON,
};
use chrono::{DateTime, SecondsFormat, Utc};
use common::jobs::{ChunkStatus, UploadStatus};
use common::model::csv::{RawRow, RowValidationError};
use common::model::upload::{ChunkDescriptor, UploadJobSnapshot};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS uploads (
    id              TEXT PRIMARY KEY,
    original_name   TEXT NOT NULL,
    size            INTEGER NOT NULL,
    checksum        TEXT NOT NULL,
    declared_mime   TEXT NOT NULL,
    detected_mime   TEXT NOT NULL,
    owner_id        TEXT NOT NULL,
    status          TEXT NOT NULL,
    progress        REAL NOT NULL DEFAULT 0,
    total_rows      INTEGER NOT NULL DEFAULT 0,
    processed_rows  INTEGER NOT NULL DEFAULT 0,
    success_count   INTEGER NOT NULL DEFAULT 0,
    error_count     INTEGER NOT NULL DEFAULT 0,
    fatal_errors    TEXT NOT NULL DEFAULT '[]',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    chunk_size      INTEGER NOT NULL,
    columns         TEXT NOT NULL DEFAULT '[]',
    source_path     TEXT NOT NULL,
    start_time      TEXT NOT NULL,
    end_time        TEXT,
    -- Set once every row of the file has been cut into chunks.
    chunking_done   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS uploads_status ON uploads (status, start_time);

CREATE TABLE IF NOT EXISTS chunks (
    id              TEXT PRIMARY KEY,
    upload_id       TEXT NOT NULL REFERENCES uploads (id),
    idx             INTEGER NOT NULL,
    start_row       INTEGER NOT NULL,
    end_row         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    processed       INTEGER NOT NULL DEFAULT 0,
    attempts        INTEGER NOT NULL DEFAULT 0,
    rows_succeeded  INTEGER NOT NULL DEFAULT 0,
    rows_failed     INTEGER NOT NULL DEFAULT 0,
    payload         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS chunks_upload ON chunks (upload_id, idx);

CREATE TABLE IF NOT EXISTS row_errors (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_id   TEXT NOT NULL,
    chunk_id    TEXT NOT NULL,
    row         INTEGER NOT NULL,
    fields      TEXT NOT NULL,
    message     TEXT NOT NULL,
    raw         TEXT,
    dead_chunk  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS row_errors_upload ON row_errors (upload_id, id);

CREATE TABLE IF NOT EXISTS order_rows (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_id       TEXT NOT NULL,
    chunk_id        TEXT NOT NULL,
    row             INTEGER NOT NULL,
    dedupe_key      TEXT NOT NULL UNIQUE,
    invoice_id      TEXT NOT NULL,
    customer_name   TEXT NOT NULL,
    item_name       TEXT NOT NULL,
    quantity        REAL NOT NULL,
    unit_price      REAL NOT NULL,
    total_price     REAL NOT NULL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS order_rows_upload ON order_rows (upload_id);
";

const UPLOAD_COLUMNS: &str = "id, original_name, size, checksum, declared_mime, detected_mime, \
     owner_id, status, progress, total_rows, processed_rows, success_count, error_count, \
     fatal_errors, retry_count, max_retries, chunk_size, columns, source_path, start_time, end_time";

const CHUNK_COLUMNS: &str =
    "id, idx, start_row, end_row, status, processed, attempts, rows_succeeded, rows_failed";

pub struct SqliteStore {
    path: PathBuf,
    error_cap: usize,
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_text<T: std::str::FromStr<Err = String>>(idx: usize, text: &str) -> rusqlite::Result<T> {
    text.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn status_list(statuses: &[UploadStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn upload_from_row(row: &Row<'_>) -> rusqlite::Result<UploadJobSnapshot> {
    let status: String = row.get(7)?;
    let fatal_errors: String = row.get(13)?;
    let columns: String = row.get(17)?;
    let start_time: String = row.get(19)?;
    let end_time: Option<String> = row.get(20)?;
    Ok(UploadJobSnapshot {
        id: row.get(0)?,
        original_name: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        checksum: row.get(3)?,
        declared_mime: row.get(4)?,
        detected_mime: row.get(5)?,
        owner_id: row.get(6)?,
        status: parse_text(7, &status)?,
        progress: row.get(8)?,
        total_rows: row.get::<_, i64>(9)? as u64,
        processed_rows: row.get::<_, i64>(10)? as u64,
        success_count: row.get::<_, i64>(11)? as u64,
        error_count: row.get::<_, i64>(12)? as u64,
        errors: Vec::new(),
        fatal_errors: parse_json(13, &fatal_errors)?,
        retry_count: row.get(14)?,
        max_retries: row.get(15)?,
        chunk_size: row.get(16)?,
        columns: parse_json(17, &columns)?,
        chunks: Vec::new(),
        source_path: row.get(18)?,
        start_time: parse_timestamp(19, &start_time)?,
        end_time: end_time.map(|t| parse_timestamp(20, &t)).transpose()?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<ChunkDescriptor> {
    let status: String = row.get(4)?;
    Ok(ChunkDescriptor {
        id: row.get(0)?,
        index: row.get(1)?,
        start_row: row.get::<_, i64>(2)? as u64,
        end_row: row.get::<_, i64>(3)? as u64,
        status: parse_text::<ChunkStatus>(4, &status)?,
        processed: row.get(5)?,
        attempts: row.get(6)?,
        rows_succeeded: row.get::<_, i64>(7)? as u64,
        rows_failed: row.get::<_, i64>(8)? as u64,
    })
}

fn load_upload(conn: &Connection, upload_id: &str) -> rusqlite::Result<Option<UploadJobSnapshot>> {
    let mut upload = match conn
        .query_row(
            &format!("SELECT {} FROM uploads WHERE id = ?1", UPLOAD_COLUMNS),
            params![upload_id],
            upload_from_row,
        )
        .optional()?
    {
        Some(upload) => upload,
        None => return Ok(None),
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM chunks WHERE upload_id = ?1 ORDER BY idx",
        CHUNK_COLUMNS
    ))?;
    upload.chunks = stmt
        .query_map(params![upload_id], chunk_from_row)?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare(
        "SELECT row, fields, message, raw FROM row_errors WHERE upload_id = ?1 ORDER BY id",
    )?;
    upload.errors = stmt
        .query_map(params![upload_id], |row| {
            let fields: String = row.get(1)?;
            Ok(RowValidationError {
                row: row.get::<_, i64>(0)? as u64,
                fields: parse_json(1, &fields)?,
                message: row.get(2)?,
                raw: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;

    Ok(Some(upload))
}

fn current_status(tx: &Transaction<'_>, upload_id: &str) -> rusqlite::Result<Option<UploadStatus>> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM uploads WHERE id = ?1",
            params![upload_id],
            |row| row.get(0),
        )
        .optional()?;
    status.map(|s| parse_text(0, &s)).transpose()
}

fn load_chunk(conn: &Connection, chunk_id: &str) -> rusqlite::Result<Option<ChunkDescriptor>> {
    conn.query_row(
        &format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS),
        params![chunk_id],
        chunk_from_row,
    )
    .optional()
}

/// Counts of settled chunks of one upload: (total, completed, dead).
fn chunk_tally(tx: &Transaction<'_>, upload_id: &str) -> rusqlite::Result<(i64, i64, i64)> {
    tx.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'failed'), 0)
         FROM chunks WHERE upload_id = ?1",
        params![upload_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
}

/// Recomputes progress and, once chunking is done and every chunk settled,
/// applies the final status.
fn refresh_progress(tx: &Transaction<'_>, upload_id: &str) -> rusqlite::Result<()> {
    let status = match current_status(tx, upload_id)? {
        Some(status) => status,
        None => return Ok(()),
    };
    if status != UploadStatus::Processing {
        return Ok(());
    }
    let (total, completed, dead) = chunk_tally(tx, upload_id)?;
    let settled = completed + dead;
    let progress = if total == 0 {
        100.0
    } else {
        settled as f64 / total as f64 * 100.0
    };
    tx.execute(
        "UPDATE uploads SET progress = MAX(progress, ?1) WHERE id = ?2",
        params![progress, upload_id],
    )?;

    if settled == total {
        let final_status = if dead == 0 {
            UploadStatus::Completed
        } else if completed > 0 {
            UploadStatus::PartiallyCompleted
        } else {
            UploadStatus::Failed
        };
        tx.execute(
            "UPDATE uploads SET status = ?1, progress = 100, end_time = ?2 WHERE id = ?3",
            params![final_status.as_str(), timestamp(Utc::now()), upload_id],
        )?;
        debug!("upload {} settled as {}", upload_id, final_status);
    }
    Ok(())
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>, error_cap: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            error_cap,
        }
    }

    /// Creates the tables and switches the database to WAL mode.
    pub fn init(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }

    fn append_row_errors(
        &self,
        tx: &Transaction<'_>,
        upload_id: &str,
        chunk_id: &str,
        errors: &[RowValidationError],
        dead_chunk: bool,
    ) -> Result<()> {
        let stored: i64 = tx.query_row(
            "SELECT COUNT(*) FROM row_errors WHERE upload_id = ?1",
            params![upload_id],
            |row| row.get(0),
        )?;
        let room = self.error_cap.saturating_sub(stored as usize);
        let mut stmt = tx.prepare(
            "INSERT INTO row_errors (upload_id, chunk_id, row, fields, message, raw, dead_chunk)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for error in errors.iter().take(room) {
            stmt.execute(params![
                upload_id,
                chunk_id,
                error.row as i64,
                serde_json::to_string(&error.fields)?,
                error.message,
                error.raw,
                dead_chunk,
            ])?;
        }
        Ok(())
    }

    /// Number of ingested rows, for tests and diagnostics.
    pub fn count_order_rows(&self, upload_id: &str) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_rows WHERE upload_id = ?1",
            params![upload_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl UploadRepository for SqliteStore {
    fn create_upload(&self, upload: &UploadJobSnapshot) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            &format!(
                "INSERT INTO uploads ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, \
                 ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                UPLOAD_COLUMNS
            ),
            params![
                upload.id,
                upload.original_name,
                upload.size as i64,
                upload.checksum,
                upload.declared_mime,
                upload.detected_mime,
                upload.owner_id,
                upload.status.as_str(),
                upload.progress,
                upload.total_rows as i64,
                upload.processed_rows as i64,
                upload.success_count as i64,
                upload.error_count as i64,
                serde_json::to_string(&upload.fatal_errors)?,
                upload.retry_count,
                upload.max_retries,
                upload.chunk_size,
                serde_json::to_string(&upload.columns)?,
                upload.source_path,
                timestamp(upload.start_time),
                upload.end_time.map(timestamp),
            ],
        )?;
        Ok(())
    }

    fn get_upload(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>> {
        let conn = self.connect()?;
        Ok(load_upload(&conn, upload_id)?)
    }

    fn transition(
        &self,
        upload_id: &str,
        from: &[UploadStatus],
        to: UploadStatus,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let end_time = to.is_terminal().then(|| timestamp(Utc::now()));
        let changed = conn.execute(
            &format!(
                "UPDATE uploads SET status = ?1, end_time = ?2 WHERE id = ?3 AND status IN ({})",
                status_list(from)
            ),
            params![to.as_str(), end_time, upload_id],
        )?;
        Ok(changed == 1)
    }

    fn fail_upload(&self, upload_id: &str, reasons: &[String]) -> Result<bool> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT fatal_errors FROM uploads WHERE id = ?1 AND status IN ({})",
                    status_list(&UploadStatus::ACTIVE)
                ),
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            return Ok(false);
        };
        let mut all: Vec<String> = serde_json::from_str(&existing)?;
        all.extend(reasons.iter().cloned());
        tx.execute(
            "UPDATE uploads SET status = ?1, fatal_errors = ?2, end_time = ?3 WHERE id = ?4",
            params![
                UploadStatus::Failed.as_str(),
                serde_json::to_string(&all)?,
                timestamp(Utc::now()),
                upload_id
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn set_file_info(
        &self,
        upload_id: &str,
        size: u64,
        checksum: &str,
        detected_mime: &str,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE uploads SET size = ?1, checksum = ?2, detected_mime = ?3 WHERE id = ?4",
            params![size as i64, checksum, detected_mime, upload_id],
        )?;
        Ok(())
    }

    fn set_columns(&self, upload_id: &str, columns: &[String]) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE uploads SET columns = ?1 WHERE id = ?2",
            params![serde_json::to_string(columns)?, upload_id],
        )?;
        Ok(())
    }

    fn register_chunk(
        &self,
        upload_id: &str,
        chunk: &ChunkDescriptor,
        rows: &[RawRow],
    ) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO chunks (id, upload_id, idx, start_row, end_row, status, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.id,
                upload_id,
                chunk.index,
                chunk.start_row as i64,
                chunk.end_row as i64,
                chunk.status.as_str(),
                serde_json::to_string(rows)?,
            ],
        )?;
        tx.execute(
            "UPDATE uploads SET total_rows = total_rows + ?1 WHERE id = ?2",
            params![chunk.row_count() as i64, upload_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn finish_chunking(&self, upload_id: &str) -> Result<Option<UploadJobSnapshot>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE uploads SET status = ?1, chunking_done = 1 WHERE id = ?2 AND status = ?3",
            params![
                UploadStatus::Processing.as_str(),
                upload_id,
                UploadStatus::Chunking.as_str()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        refresh_progress(&tx, upload_id)?;
        tx.commit()?;
        Ok(load_upload(&conn, upload_id)?)
    }

    fn chunk_rows(&self, chunk_id: &str) -> Result<Vec<RawRow>> {
        let conn = self.connect()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM chunks WHERE id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or_else(|| IngestError::NotFound(chunk_id.to_string()))?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkDescriptor>> {
        let conn = self.connect()?;
        Ok(load_chunk(&conn, chunk_id)?)
    }

    fn mark_chunk_processing(&self, chunk_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE chunks SET status = 'processing'
             WHERE id = ?1 AND status IN ('pending', 'retried')",
            params![chunk_id],
        )?;
        Ok(())
    }

    fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT 1 FROM order_rows WHERE dedupe_key = ?1")?;
        let mut found = HashSet::new();
        for key in keys {
            if stmt.exists(params![key])? {
                found.insert(key.clone());
            }
        }
        Ok(found)
    }

    fn commit_chunk(
        &self,
        upload_id: &str,
        chunk_id: &str,
        records: &[OrderRecord],
        rejected: &[RowValidationError],
    ) -> Result<CommitSummary> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let chunk = load_chunk(&tx, chunk_id)?
            .ok_or_else(|| IngestError::NotFound(chunk_id.to_string()))?;
        if chunk.processed {
            return Ok(CommitSummary {
                rows_succeeded: chunk.rows_succeeded,
                rows_failed: chunk.rows_failed,
                already_committed: true,
            });
        }

        let now = timestamp(Utc::now());
        let mut late_duplicates = Vec::new();
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO order_rows (upload_id, chunk_id, row, dedupe_key, invoice_id,
                     customer_name, item_name, quantity, unit_price, total_price, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for record in records {
                let changed = stmt.execute(params![
                    upload_id,
                    chunk_id,
                    record.row as i64,
                    record.dedupe_key,
                    record.invoice_id,
                    record.customer_name,
                    record.item_name,
                    record.quantity,
                    record.unit_price,
                    record.total_price,
                    now,
                ])?;
                if changed == 1 {
                    inserted += 1;
                } else {
                    late_duplicates.push(RowValidationError {
                        row: record.row,
                        fields: vec!["Invoice ID".to_string(), "Item Name".to_string()],
                        message: format!(
                            "duplicate: invoice '{}' item '{}' was stored concurrently",
                            record.invoice_id, record.item_name
                        ),
                        raw: None,
                    });
                }
            }
        }

        let mut errors: Vec<RowValidationError> = rejected.to_vec();
        errors.extend(late_duplicates);
        errors.sort_by_key(|e| e.row);
        self.append_row_errors(&tx, upload_id, chunk_id, &errors, false)?;

        let failed = errors.len() as u64;
        tx.execute(
            "UPDATE chunks SET processed = 1, rows_succeeded = ?1, rows_failed = ?2 WHERE id = ?3",
            params![inserted as i64, failed as i64, chunk_id],
        )?;
        tx.commit()?;

        Ok(CommitSummary {
            rows_succeeded: inserted,
            rows_failed: failed,
            already_committed: false,
        })
    }

    fn settle_chunk(
        &self,
        upload_id: &str,
        chunk_id: &str,
        resolution: ChunkResolution,
    ) -> Result<Option<UploadJobSnapshot>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match current_status(&tx, upload_id)? {
            Some(status) if !status.is_terminal() => {}
            _ => return Ok(None),
        }
        let Some(chunk) = load_chunk(&tx, chunk_id)? else {
            return Ok(None);
        };
        if chunk.status.is_settled() {
            return Ok(None);
        }

        match resolution {
            ChunkResolution::Completed => {
                if !chunk.processed {
                    return Err(IngestError::ChunkProcessing(format!(
                        "chunk {} reported complete without a commit",
                        chunk_id
                    )));
                }
                tx.execute(
                    "UPDATE chunks SET status = 'completed' WHERE id = ?1",
                    params![chunk_id],
                )?;
                tx.execute(
                    "UPDATE uploads SET processed_rows = processed_rows + ?1,
                         success_count = success_count + ?2, error_count = error_count + ?3
                     WHERE id = ?4",
                    params![
                        (chunk.rows_succeeded + chunk.rows_failed) as i64,
                        chunk.rows_succeeded as i64,
                        chunk.rows_failed as i64,
                        upload_id
                    ],
                )?;
            }
            ChunkResolution::Dead { reason } => {
                let rows = chunk.row_count();
                tx.execute(
                    "UPDATE chunks SET status = 'failed' WHERE id = ?1",
                    params![chunk_id],
                )?;
                tx.execute(
                    "UPDATE uploads SET processed_rows = processed_rows + ?1,
                         error_count = error_count + ?1
                     WHERE id = ?2",
                    params![rows as i64, upload_id],
                )?;
                let error = RowValidationError {
                    row: chunk.start_row + 1,
                    fields: Vec::new(),
                    message: format!(
                        "rows {}-{} not ingested, chunk {} failed after {} attempts: {}",
                        chunk.start_row + 1,
                        chunk.end_row,
                        chunk.index,
                        chunk.attempts + 1,
                        reason
                    ),
                    raw: None,
                };
                self.append_row_errors(&tx, upload_id, chunk_id, &[error], true)?;
            }
        }

        refresh_progress(&tx, upload_id)?;
        tx.commit()?;
        Ok(load_upload(&conn, upload_id)?)
    }

    fn record_chunk_failure(
        &self,
        upload_id: &str,
        chunk_id: &str,
        max_retries: u32,
    ) -> Result<FailureDecision> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match current_status(&tx, upload_id)? {
            Some(status) if !status.is_terminal() => {}
            _ => return Ok(FailureDecision::Ignored),
        }
        let Some(chunk) = load_chunk(&tx, chunk_id)? else {
            return Ok(FailureDecision::Ignored);
        };
        if chunk.status.is_settled() {
            return Ok(FailureDecision::Ignored);
        }
        if chunk.attempts >= max_retries {
            return Ok(FailureDecision::Exhausted {
                attempts: chunk.attempts,
            });
        }

        let attempt = chunk.attempts + 1;
        tx.execute(
            "UPDATE chunks SET status = 'retried', attempts = ?1 WHERE id = ?2",
            params![attempt, chunk_id],
        )?;
        tx.execute(
            "UPDATE uploads SET retry_count = retry_count + 1 WHERE id = ?1",
            params![upload_id],
        )?;
        tx.commit()?;
        Ok(FailureDecision::Retry { attempt })
    }

    fn reopen_failed_chunks(&self, upload_id: &str) -> Result<Vec<ChunkDescriptor>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (status, chunking_done, fatal_errors): (String, bool, String) = tx
            .query_row(
                "SELECT status, chunking_done, fatal_errors FROM uploads WHERE id = ?1",
                params![upload_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| IngestError::NotFound(upload_id.to_string()))?;
        let status: UploadStatus = parse_text(0, &status)?;
        let refuse = || IngestError::InvalidState {
            upload_id: upload_id.to_string(),
            status,
        };
        // A file that was never fully chunked cannot be completed by retrying
        // the chunks it left behind. Only a timeout leaves unfinished chunks
        // worth another run.
        let reopen_unfinished = match status {
            UploadStatus::PartiallyCompleted => false,
            UploadStatus::Failed => {
                let reasons: Vec<String> = serde_json::from_str(&fatal_errors)?;
                if !chunking_done || reasons.iter().any(|r| !r.starts_with(TIMEOUT_REASON)) {
                    return Err(refuse());
                }
                !reasons.is_empty()
            }
            _ => return Err(refuse()),
        };

        let chunks: Vec<ChunkDescriptor> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM chunks WHERE upload_id = ?1 ORDER BY idx",
                CHUNK_COLUMNS
            ))?;
            let rows = stmt.query_map(params![upload_id], chunk_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|c| {
                    c.status == ChunkStatus::Failed
                        || (reopen_unfinished && c.status != ChunkStatus::Completed)
                })
                .collect()
        };
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut reopened = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            if chunk.status == ChunkStatus::Failed {
                let rows = chunk.row_count() as i64;
                tx.execute(
                    "UPDATE uploads SET processed_rows = processed_rows - ?1,
                         error_count = error_count - ?1
                     WHERE id = ?2",
                    params![rows, upload_id],
                )?;
                tx.execute(
                    "DELETE FROM row_errors WHERE chunk_id = ?1 AND dead_chunk = 1",
                    params![chunk.id],
                )?;
            }
            tx.execute(
                "UPDATE chunks SET status = 'retried', attempts = 0 WHERE id = ?1",
                params![chunk.id],
            )?;
            chunk.status = ChunkStatus::Retried;
            chunk.attempts = 0;
            reopened.push(chunk);
        }

        let (total, completed, dead) = chunk_tally(&tx, upload_id)?;
        let progress = if total == 0 {
            0.0
        } else {
            (completed + dead) as f64 / total as f64 * 100.0
        };
        tx.execute(
            "UPDATE uploads SET status = ?1, progress = ?2, fatal_errors = '[]', end_time = NULL
             WHERE id = ?3",
            params![UploadStatus::Processing.as_str(), progress, upload_id],
        )?;
        tx.commit()?;
        Ok(reopened)
    }

    fn list_by_status(&self, statuses: &[UploadStatus]) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM uploads WHERE status IN ({}) ORDER BY start_time",
            status_list(statuses)
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM uploads WHERE status IN ({}) AND start_time < ?1 ORDER BY start_time",
            status_list(&UploadStatus::ACTIVE)
        ))?;
        let ids = stmt
            .query_map(params![timestamp(cutoff)], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    fn list_active_sources(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT source_path FROM uploads WHERE status IN ({})",
            status_list(&UploadStatus::ACTIVE)
        ))?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::rows::dedupe_key;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::new(dir.path().join("test.sqlite"), 3);
        store.init().unwrap();
        store
    }

    fn upload(id: &str, status: UploadStatus) -> UploadJobSnapshot {
        UploadJobSnapshot {
            id: id.to_string(),
            original_name: "orders.csv".to_string(),
            size: 10,
            checksum: "abc".to_string(),
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
            max_retries: 2,
            chunk_size: 2,
            columns: Vec::new(),
            chunks: Vec::new(),
            source_path: format!("/tmp/{}.csv", id),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    fn record(row: u64, invoice: &str) -> OrderRecord {
        OrderRecord {
            row,
            dedupe_key: dedupe_key(invoice, "Rice"),
            invoice_id: invoice.to_string(),
            customer_name: "Acme".to_string(),
            item_name: "Rice".to_string(),
            quantity: 1.0,
            unit_price: 2.0,
            total_price: 2.0,
        }
    }

    fn rows(range: std::ops::Range<u64>) -> Vec<RawRow> {
        range
            .map(|r| RawRow {
                row: r + 1,
                values: vec![format!("INV-{}", r)],
            })
            .collect()
    }

    /// Upload with two registered chunks of two rows, chunking finished.
    fn processing_upload(store: &SqliteStore, id: &str) {
        store.create_upload(&upload(id, UploadStatus::Chunking)).unwrap();
        for index in 0..2u32 {
            let start = index as u64 * 2;
            let chunk = ChunkDescriptor::new(id, index, start, start + 2);
            store.register_chunk(id, &chunk, &rows(start..start + 2)).unwrap();
        }
        let snapshot = store.finish_chunking(id).unwrap().unwrap();
        assert_eq!(snapshot.status, UploadStatus::Processing);
        assert_eq!(snapshot.total_rows, 4);
    }

    #[test]
    fn transition_is_guarded_by_current_status() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create_upload(&upload("u1", UploadStatus::Pending)).unwrap();

        assert!(store
            .transition("u1", &[UploadStatus::Pending], UploadStatus::Validating)
            .unwrap());
        assert!(!store
            .transition("u1", &[UploadStatus::Pending], UploadStatus::Validating)
            .unwrap());
        assert!(store
            .transition("u1", &UploadStatus::ACTIVE, UploadStatus::Cancelled)
            .unwrap());

        let snapshot = store.get_upload("u1").unwrap().unwrap();
        assert_eq!(snapshot.status, UploadStatus::Cancelled);
        assert!(snapshot.end_time.is_some());
        assert!(!store.fail_upload("u1", &["late".to_string()]).unwrap());
    }

    #[test]
    fn commit_is_idempotent_per_chunk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        processing_upload(&store, "u1");

        let first = store
            .commit_chunk("u1", "u1-0", &[record(1, "A"), record(2, "B")], &[])
            .unwrap();
        assert_eq!(first.rows_succeeded, 2);
        assert!(!first.already_committed);

        let again = store
            .commit_chunk("u1", "u1-0", &[record(1, "A"), record(2, "B")], &[])
            .unwrap();
        assert!(again.already_committed);
        assert_eq!(again.rows_succeeded, 2);
        assert_eq!(store.count_order_rows("u1").unwrap(), 2);
    }

    #[test]
    fn unique_key_turns_cross_chunk_races_into_row_errors() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        processing_upload(&store, "u1");

        store.commit_chunk("u1", "u1-0", &[record(1, "A")], &[]).unwrap();
        let summary = store
            .commit_chunk("u1", "u1-1", &[record(3, "A"), record(4, "C")], &[])
            .unwrap();
        assert_eq!(summary.rows_succeeded, 1);
        assert_eq!(summary.rows_failed, 1);

        let snapshot = store.get_upload("u1").unwrap().unwrap();
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors[0].row, 3);
    }

    #[test]
    fn settling_every_chunk_applies_final_status_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        processing_upload(&store, "u1");

        store
            .commit_chunk("u1", "u1-1", &[record(3, "C"), record(4, "D")], &[])
            .unwrap();
        let after_second = store
            .settle_chunk("u1", "u1-1", ChunkResolution::Completed)
            .unwrap()
            .unwrap();
        assert_eq!(after_second.progress, 50.0);
        assert_eq!(after_second.processed_rows, 2);

        assert!(store
            .settle_chunk("u1", "u1-1", ChunkResolution::Completed)
            .unwrap()
            .is_none());

        let done = store
            .settle_chunk(
                "u1",
                "u1-0",
                ChunkResolution::Dead {
                    reason: "store offline".to_string(),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.status, UploadStatus::PartiallyCompleted);
        assert_eq!(done.processed_rows, 4);
        assert_eq!(done.success_count + done.error_count, done.processed_rows);
        assert_eq!(done.progress, 100.0);
        assert!(done.errors[0].message.contains("store offline"));
    }

    #[test]
    fn failures_retry_until_budget_is_spent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        processing_upload(&store, "u1");

        assert_eq!(
            store.record_chunk_failure("u1", "u1-0", 2).unwrap(),
            FailureDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            store.record_chunk_failure("u1", "u1-0", 2).unwrap(),
            FailureDecision::Retry { attempt: 2 }
        );
        assert_eq!(
            store.record_chunk_failure("u1", "u1-0", 2).unwrap(),
            FailureDecision::Exhausted { attempts: 2 }
        );
        let snapshot = store.get_upload("u1").unwrap().unwrap();
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.chunks[0].status, ChunkStatus::Retried);
    }

    #[test]
    fn reopen_rolls_back_dead_chunk_counters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        processing_upload(&store, "u1");
        store.commit_chunk("u1", "u1-0", &[record(1, "A")], &[]).unwrap();
        store.settle_chunk("u1", "u1-0", ChunkResolution::Completed).unwrap();
        store
            .settle_chunk("u1", "u1-1", ChunkResolution::Dead { reason: "x".into() })
            .unwrap();

        let reopened = store.reopen_failed_chunks("u1").unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].id, "u1-1");

        let snapshot = store.get_upload("u1").unwrap().unwrap();
        assert_eq!(snapshot.status, UploadStatus::Processing);
        assert_eq!(snapshot.processed_rows, 1);
        assert_eq!(snapshot.error_count, 0);
        assert!(snapshot.errors.is_empty());
        assert_eq!(snapshot.progress, 50.0);
        assert!(snapshot.end_time.is_none());
    }

    #[test]
    fn row_errors_are_capped_per_upload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        processing_upload(&store, "u1");
        let rejected: Vec<RowValidationError> = (1..=5)
            .map(|row| RowValidationError {
                row,
                fields: vec!["Quantity".to_string()],
                message: "not a number: Quantity".to_string(),
                raw: None,
            })
            .collect();

        let summary = store.commit_chunk("u1", "u1-0", &[], &rejected).unwrap();
        assert_eq!(summary.rows_failed, 5);
        assert_eq!(store.get_upload("u1").unwrap().unwrap().errors.len(), 3);
    }

    #[test]
    fn stale_listing_ignores_terminal_uploads() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut old = upload("old", UploadStatus::Processing);
        old.start_time = Utc::now() - chrono::Duration::hours(30);
        store.create_upload(&old).unwrap();
        let mut done = upload("done", UploadStatus::Completed);
        done.start_time = Utc::now() - chrono::Duration::hours(30);
        store.create_upload(&done).unwrap();
        store.create_upload(&upload("fresh", UploadStatus::Processing)).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.list_stale(cutoff).unwrap(), vec!["old".to_string()]);
        assert_eq!(store.list_active_sources().unwrap().len(), 2);
    }
}
