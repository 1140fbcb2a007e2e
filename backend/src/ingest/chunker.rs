//! Streams a validated file and cuts it into fixed-size chunks.
//!
//! The chunker never holds more than one batch of rows in memory. Each batch is
//! handed to a `ChunkSink` as soon as it is full, so workers can start on the
//! first chunk while the rest of the file is still being read.

use crate::error::Result;
use common::model::csv::RawRow;
use common::model::upload::ChunkDescriptor;
use std::path::Path;

/// Receives the header and each finished batch.
pub trait ChunkSink {
    fn columns(&mut self, columns: &[String]) -> Result<()>;
    fn chunk(&mut self, descriptor: ChunkDescriptor, rows: Vec<RawRow>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingSummary {
    pub total_rows: u64,
    pub total_chunks: u32,
}

pub fn expected_chunks(total_rows: u64, chunk_size: u32) -> u64 {
    total_rows.div_ceil(chunk_size.max(1) as u64)
}

/// Reads `path` row by row and emits batches of `chunk_size` rows, the last one
/// possibly short. Rows keep file order inside and across chunks. A CSV parse
/// error aborts with `IngestError::Csv`.
pub fn chunk_file(
    path: &Path,
    upload_id: &str,
    chunk_size: u32,
    sink: &mut impl ChunkSink,
) -> Result<ChunkingSummary> {
    let chunk_size = chunk_size.max(1) as usize;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    sink.columns(&columns)?;

    let mut batch: Vec<RawRow> = Vec::with_capacity(chunk_size);
    let mut total_rows = 0u64;
    let mut index = 0u32;
    let mut batch_start = 0u64;

    for record in reader.records() {
        let record = record?;
        total_rows += 1;
        batch.push(RawRow {
            row: total_rows,
            values: record.iter().map(str::to_string).collect(),
        });
        if batch.len() == chunk_size {
            let rows = std::mem::replace(&mut batch, Vec::with_capacity(chunk_size));
            sink.chunk(
                ChunkDescriptor::new(upload_id, index, batch_start, total_rows),
                rows,
            )?;
            index += 1;
            batch_start = total_rows;
        }
    }

    if !batch.is_empty() {
        sink.chunk(
            ChunkDescriptor::new(upload_id, index, batch_start, total_rows),
            batch,
        )?;
        index += 1;
    }

    Ok(ChunkingSummary {
        total_rows,
        total_chunks: index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct Collect {
        columns: Vec<String>,
        chunks: Vec<(ChunkDescriptor, Vec<RawRow>)>,
    }

    impl ChunkSink for Collect {
        fn columns(&mut self, columns: &[String]) -> Result<()> {
            self.columns = columns.to_vec();
            Ok(())
        }

        fn chunk(&mut self, descriptor: ChunkDescriptor, rows: Vec<RawRow>) -> Result<()> {
            self.chunks.push((descriptor, rows));
            Ok(())
        }
    }

    fn file_with_rows(n: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Invoice ID,Customer Name,Item Name,Item Price,Quantity,Total").unwrap();
        for i in 0..n {
            writeln!(file, "INV-{},Acme,Item {},1.00,1,1.00", i, i).unwrap();
        }
        file
    }

    #[test]
    fn splits_rows_into_ceil_n_over_c_chunks() {
        let file = file_with_rows(2500);
        let mut sink = Collect::default();
        let summary = chunk_file(file.path(), "up", 1000, &mut sink).unwrap();

        assert_eq!(summary.total_rows, 2500);
        assert_eq!(summary.total_chunks as u64, expected_chunks(2500, 1000));
        let sizes: Vec<usize> = sink.chunks.iter().map(|(_, rows)| rows.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let (last, rows) = &sink.chunks[2];
        assert_eq!(last.id, "up-2");
        assert_eq!((last.start_row, last.end_row), (2000, 2500));
        assert_eq!(rows[0].row, 2001);
        assert_eq!(rows[0].values[0], "INV-2000");
        assert_eq!(sink.columns[0], "Invoice ID");
    }

    #[test]
    fn exact_multiple_has_no_trailing_chunk() {
        let file = file_with_rows(20);
        let mut sink = Collect::default();
        let summary = chunk_file(file.path(), "up", 10, &mut sink).unwrap();
        assert_eq!(summary.total_chunks, 2);
    }

    #[test]
    fn header_only_and_empty_files_yield_no_chunks() {
        let header_only = file_with_rows(0);
        let mut sink = Collect::default();
        let summary = chunk_file(header_only.path(), "up", 10, &mut sink).unwrap();
        assert_eq!(summary, ChunkingSummary { total_rows: 0, total_chunks: 0 });

        let empty = NamedTempFile::new().unwrap();
        let mut sink = Collect::default();
        let summary = chunk_file(empty.path(), "up", 10, &mut sink).unwrap();
        assert_eq!(summary.total_chunks, 0);
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn invalid_utf8_aborts_chunking() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Invoice ID,Total\nINV-1,1\nINV-\xff\xfe,2\n").unwrap();
        let mut sink = Collect::default();
        let err = chunk_file(file.path(), "up", 1, &mut sink).unwrap_err();
        assert!(matches!(err, IngestError::Csv(_)));
        assert_eq!(sink.chunks.len(), 1);
    }

    #[test]
    fn expected_chunks_rounds_up() {
        assert_eq!(expected_chunks(0, 1000), 0);
        assert_eq!(expected_chunks(1, 1000), 1);
        assert_eq!(expected_chunks(1001, 1000), 2);
    }
}
