//! Parquet part writer.
//!
//! Rows are buffered and flushed as row groups of the configured size.
//! Column inference matches the CSV writer: `_id` first, remaining keys in
//! lexicographic order, with per-column types taken from the first
//! non-null value in the first batch. ObjectIds are normalized to their
//! 24-character hex form. The compression codec lives inside the Parquet
//! container, so part files keep the bare `.parquet` extension.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMillisecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use bson::{Bson, Document};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parlake_types::error::{Result, SnapshotError};
use parlake_types::format::{Compression, DEFAULT_GZIP_LEVEL, DEFAULT_ZSTD_LEVEL};
use parlake_types::options::SnapshotOptions;
use parlake_types::value::to_json;

use super::compress::{CountingWriter, FileSink};
use super::{infer_columns, io_err, PartNaming, PartWriter};
use crate::manifest::ManifestStore;
use crate::queue::BatchPayload;
use crate::telemetry::ProgressCounters;

struct OpenPart {
    writer: ArrowWriter<FileSink>,
    part_index: usize,
    written: Arc<AtomicU64>,
    reported_bytes: u64,
    rows_in_part: u64,
}

pub(crate) struct ParquetWriter {
    naming: PartNaming,
    manifest: Arc<ManifestStore>,
    counters: Arc<ProgressCounters>,
    compression: Compression,
    compression_level: Option<i32>,
    row_group_size: usize,
    rotate_rows: Option<u64>,
    rotate_bytes: Option<u64>,
    schema: Option<SchemaRef>,
    columns: Vec<String>,
    pending: Vec<Document>,
    current: Option<OpenPart>,
    seq: u64,
}

impl ParquetWriter {
    pub(crate) fn new(
        options: &SnapshotOptions,
        effective: Compression,
        manifest: Arc<ManifestStore>,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            // The codec is parquet-internal: no outer suffix on part files.
            naming: PartNaming::new(options, Compression::None),
            manifest,
            counters,
            compression: effective,
            compression_level: options.compression_level,
            row_group_size: options.parquet_row_group.max(1),
            rotate_rows: options.rotate_rows,
            rotate_bytes: (!options.single_file).then_some(options.rotate_bytes),
            schema: None,
            columns: Vec::new(),
            pending: Vec::new(),
            current: None,
            seq: 0,
        }
    }

    fn codec(&self) -> Result<ParquetCompression> {
        match self.compression {
            Compression::Zstd => {
                let level = self.compression_level.unwrap_or(DEFAULT_ZSTD_LEVEL);
                Ok(ParquetCompression::ZSTD(
                    ZstdLevel::try_new(level).map_err(io_err)?,
                ))
            }
            Compression::Gzip => {
                let level = self
                    .compression_level
                    .and_then(|l| u32::try_from(l).ok())
                    .map_or(DEFAULT_GZIP_LEVEL, |l| l.min(9));
                Ok(ParquetCompression::GZIP(
                    GzipLevel::try_new(level).map_err(io_err)?,
                ))
            }
            Compression::Snappy => Ok(ParquetCompression::SNAPPY),
            Compression::None => Ok(ParquetCompression::UNCOMPRESSED),
        }
    }

    fn infer_schema(&mut self, docs: &[Document]) {
        let columns = infer_columns(docs);
        let fields: Vec<Field> = columns
            .iter()
            .map(|col| Field::new(col, infer_datatype(docs, col), true))
            .collect();
        self.schema = Some(Arc::new(Schema::new(fields)));
        self.columns = columns;
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| SnapshotError::Internal("parquet part opened before schema".into()))?;
        let path = self.naming.path(self.seq);
        let written = Arc::new(AtomicU64::new(0));
        let file = std::fs::File::create(&path)?;
        let sink = CountingWriter::new(std::io::BufWriter::new(file), Arc::clone(&written));
        let props = WriterProperties::builder()
            .set_compression(self.codec()?)
            .set_max_row_group_size(self.row_group_size)
            .build();
        let writer = ArrowWriter::try_new(sink, schema, Some(props)).map_err(io_err)?;
        let part_index = self.manifest.open_part(&self.naming.file_name(self.seq))?;
        tracing::info!(part = part_index, path = %path.display(), "part opened");
        self.counters.parts_opened.fetch_add(1, Ordering::Relaxed);
        self.seq += 1;
        self.current = Some(OpenPart {
            writer,
            part_index,
            written,
            reported_bytes: 0,
            rows_in_part: 0,
        });
        Ok(())
    }

    fn record_batch(&self, rows: &[Document]) -> Result<RecordBatch> {
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| SnapshotError::Internal("parquet batch without schema".into()))?;
        let arrays: Vec<ArrayRef> = schema
            .fields()
            .iter()
            .zip(&self.columns)
            .map(|(field, col)| column_array(rows, col, field.data_type()))
            .collect();
        RecordBatch::try_new(schema, arrays).map_err(io_err)
    }

    /// Write one row-group's worth of rows into the open part.
    fn write_group(&mut self, rows: &[Document]) -> Result<()> {
        self.ensure_open()?;
        let batch = self.record_batch(rows)?;
        let part = self
            .current
            .as_mut()
            .ok_or_else(|| SnapshotError::Internal("parquet writer lost its part".into()))?;
        part.writer.write(&batch).map_err(io_err)?;
        // Force the group out so the byte counter reflects reality for
        // rotation decisions.
        part.writer.flush().map_err(io_err)?;
        part.rows_in_part += rows.len() as u64;

        let total = part.written.load(Ordering::Relaxed);
        let delta = total.saturating_sub(part.reported_bytes);
        part.reported_bytes = total;
        let part_index = part.part_index;
        self.manifest
            .add_progress_to_part(part_index, rows.len() as u64, delta)?;
        self.counters
            .rows_written
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    /// Write rows, splitting groups at the per-file row limit and rotating
    /// at either threshold. A part never exceeds `rotate_rows`.
    fn write_rows(&mut self, mut rows: Vec<Document>) -> Result<()> {
        while !rows.is_empty() {
            let take = match self.rotate_rows {
                Some(limit) => {
                    let in_part = self.current.as_ref().map_or(0, |p| p.rows_in_part);
                    let room = limit.saturating_sub(in_part);
                    if room == 0 {
                        self.finalize_current()?;
                        continue;
                    }
                    rows.len().min(usize::try_from(room).unwrap_or(usize::MAX))
                }
                None => rows.len(),
            };
            let chunk: Vec<Document> = rows.drain(..take).collect();
            self.write_group(&chunk)?;

            let rotate_by_rows = self.rotate_rows.is_some_and(|limit| {
                self.current
                    .as_ref()
                    .is_some_and(|p| p.rows_in_part >= limit)
            });
            let rotate_by_bytes = self.rotate_bytes.is_some_and(|limit| {
                self.current
                    .as_ref()
                    .is_some_and(|p| p.written.load(Ordering::Relaxed) >= limit)
            });
            if rotate_by_rows || rotate_by_bytes {
                self.finalize_current()?;
            }
        }
        Ok(())
    }

    fn finalize_current(&mut self) -> Result<()> {
        let Some(part) = self.current.take() else {
            return Ok(());
        };
        let mut sink = part.writer.into_inner().map_err(io_err)?;
        std::io::Write::flush(&mut sink)?;
        let bytes = part.written.load(Ordering::Relaxed);
        let checksum = sink.digest_hex();
        let tail = bytes.saturating_sub(part.reported_bytes);
        self.counters
            .bytes_written
            .fetch_add(tail, Ordering::Relaxed);
        self.manifest
            .complete_part(part.part_index, bytes, Some(checksum))?;
        tracing::info!(part = part.part_index, bytes, "part finalized");
        Ok(())
    }
}

impl PartWriter for ParquetWriter {
    fn write_batch(&mut self, payload: BatchPayload) -> Result<()> {
        let docs = match payload {
            BatchPayload::Documents(docs) => docs,
            BatchPayload::Encoded(_) => {
                return Err(io_err("parquet writer received a pre-encoded batch"));
            }
        };
        if docs.is_empty() {
            return Ok(());
        }
        if self.schema.is_none() {
            self.infer_schema(&docs);
        }
        self.pending.extend(docs);
        while self.pending.len() >= self.row_group_size {
            let group: Vec<Document> = self.pending.drain(..self.row_group_size).collect();
            self.write_rows(group)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.row_group_size);
            let group: Vec<Document> = self.pending.drain(..take).collect();
            self.write_rows(group)?;
        }
        self.finalize_current()
    }
}

/// Column type from the first non-null value; anything non-scalar (or a
/// fully null column) lands on Utf8.
fn infer_datatype(docs: &[Document], col: &str) -> DataType {
    for doc in docs {
        match doc.get(col) {
            None | Some(Bson::Null) | Some(Bson::Undefined) => continue,
            Some(Bson::Int32(_) | Bson::Int64(_)) => return DataType::Int64,
            Some(Bson::Double(_)) => return DataType::Float64,
            Some(Bson::Boolean(_)) => return DataType::Boolean,
            Some(Bson::DateTime(_)) => {
                return DataType::Timestamp(TimeUnit::Millisecond, None);
            }
            Some(_) => return DataType::Utf8,
        }
    }
    DataType::Utf8
}

fn utf8_cell(value: &Bson) -> Option<String> {
    match value {
        Bson::Null | Bson::Undefined => None,
        Bson::String(s) | Bson::Symbol(s) => Some(s.clone()),
        Bson::Document(_) | Bson::Array(_) => Some(to_json(value).to_string()),
        other => Some(match to_json(other) {
            serde_json::Value::String(s) => s,
            json => json.to_string(),
        }),
    }
}

fn column_array(rows: &[Document], col: &str, datatype: &DataType) -> ArrayRef {
    match datatype {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(match row.get(col) {
                    Some(Bson::Int32(i)) => Some(i64::from(*i)),
                    Some(Bson::Int64(i)) => Some(*i),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(match row.get(col) {
                    Some(Bson::Double(f)) => Some(*f),
                    Some(Bson::Int32(i)) => Some(f64::from(*i)),
                    Some(Bson::Int64(i)) => Some(*i as f64),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(match row.get(col) {
                    Some(Bson::Boolean(b)) => Some(*b),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            let mut builder = TimestampMillisecondBuilder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(match row.get(col) {
                    Some(Bson::DateTime(dt)) => Some(dt.timestamp_millis()),
                    _ => None,
                });
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::new();
            for row in rows {
                builder.append_option(row.get(col).and_then(utf8_cell));
            }
            Arc::new(builder.finish())
        }
    }
}
