//! Format writers: serialize batches, compress, rotate by size, report to
//! the manifest.
//!
//! All writers share the part lifecycle: `Open(part=k) → Writing →
//! Finalizing → Open(part=k+1)`, where finalizing closes the codec stream
//! (forcing trailers), flushes the file, and marks the part complete in the
//! manifest with its exact compressed size and checksum. Parts are opened
//! lazily on the first byte, so an empty snapshot produces no files.

pub(crate) mod compress;
mod csv;
mod jsonl;
mod parquet;

pub use compress::{CodecAvailability, CodecFactory};

use std::collections::BTreeSet;
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bson::Document;
use parlake_types::error::{Result, SnapshotError};
use parlake_types::format::{Compression, SnapshotFormat};
use parlake_types::options::SnapshotOptions;

use crate::manifest::ManifestStore;
use crate::queue::BatchPayload;
use crate::telemetry::ProgressCounters;
use compress::CompressedWriter;

/// Map codec/container errors into the writer failure class.
pub(crate) fn io_err(e: impl Display) -> SnapshotError {
    SnapshotError::Io(io::Error::other(e.to_string()))
}

/// The single consumer side of the pipeline.
pub(crate) trait PartWriter: Send {
    /// Append one batch to the current part, rotating afterwards if the
    /// size threshold was crossed.
    fn write_batch(&mut self, payload: BatchPayload) -> Result<()>;

    /// Finalize the current part and release resources.
    fn close(&mut self) -> Result<()>;
}

/// Build the writer for the configured format.
pub(crate) fn create_writer(
    options: &SnapshotOptions,
    effective: Compression,
    factory: CodecFactory,
    manifest: Arc<ManifestStore>,
    counters: Arc<ProgressCounters>,
) -> Box<dyn PartWriter> {
    match options.format {
        SnapshotFormat::Jsonl => Box::new(jsonl::JsonlWriter::new(
            options, effective, factory, manifest, counters,
        )),
        SnapshotFormat::Csv => Box::new(csv::CsvWriter::new(
            options, effective, factory, manifest, counters,
        )),
        SnapshotFormat::Parquet => Box::new(parquet::ParquetWriter::new(
            options, effective, manifest, counters,
        )),
    }
}

/// Part file naming for one snapshot run.
pub(crate) struct PartNaming {
    dir: PathBuf,
    prefix: String,
    extension: &'static str,
    suffix: &'static str,
    single_file: bool,
}

impl PartNaming {
    pub(crate) fn new(options: &SnapshotOptions, effective: Compression) -> Self {
        Self {
            dir: options.output_dir.clone(),
            prefix: options.prefix.clone(),
            extension: options.format.extension(),
            suffix: effective.suffix(),
            single_file: options.single_file,
        }
    }

    /// `<prefix>.<ext>[.zst|.gz]` in single-file mode,
    /// `<prefix>-part-<seq:06>.<ext>[.zst|.gz]` otherwise.
    pub(crate) fn file_name(&self, seq: u64) -> String {
        if self.single_file {
            format!("{}.{}{}", self.prefix, self.extension, self.suffix)
        } else {
            format!(
                "{}-part-{seq:06}.{}{}",
                self.prefix, self.extension, self.suffix
            )
        }
    }

    pub(crate) fn path(&self, seq: u64) -> PathBuf {
        self.dir.join(self.file_name(seq))
    }
}

struct OpenPart {
    writer: Option<CompressedWriter>,
    part_index: usize,
    written: Arc<AtomicU64>,
    reported_bytes: u64,
    /// Freshly opened: the CSV writer uses this to emit the header.
    fresh: bool,
}

/// Shared part lifecycle for the stream-shaped writers (JSONL, CSV).
pub(crate) struct PartSink {
    naming: PartNaming,
    factory: CodecFactory,
    compression: Compression,
    manifest: Arc<ManifestStore>,
    counters: Arc<ProgressCounters>,
    /// `None` in single-file mode.
    rotate_bytes: Option<u64>,
    seq: u64,
    current: Option<OpenPart>,
}

impl PartSink {
    pub(crate) fn new(
        options: &SnapshotOptions,
        effective: Compression,
        factory: CodecFactory,
        manifest: Arc<ManifestStore>,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            naming: PartNaming::new(options, effective),
            factory,
            compression: effective,
            manifest,
            counters,
            rotate_bytes: (!options.single_file).then_some(options.rotate_bytes),
            seq: 0,
            current: None,
        }
    }

    /// The current part's stream, opening a new part if none is active.
    /// The flag is `true` when this call opened the part.
    pub(crate) fn writer(&mut self) -> Result<(&mut CompressedWriter, bool)> {
        if self.current.is_none() {
            let path = self.naming.path(self.seq);
            let written = Arc::new(AtomicU64::new(0));
            let writer = self
                .factory
                .open(&path, self.compression, Arc::clone(&written))?;
            let part_index = self.manifest.open_part(&self.naming.file_name(self.seq))?;
            tracing::info!(part = part_index, path = %path.display(), "part opened");
            self.counters.parts_opened.fetch_add(1, Ordering::Relaxed);
            self.seq += 1;
            self.current = Some(OpenPart {
                writer: Some(writer),
                part_index,
                written,
                reported_bytes: 0,
                fresh: true,
            });
        }
        let part = self
            .current
            .as_mut()
            .ok_or_else(|| SnapshotError::Internal("part sink lost its writer".into()))?;
        let fresh = part.fresh;
        part.fresh = false;
        let writer = part
            .writer
            .as_mut()
            .ok_or_else(|| SnapshotError::Internal("part sink lost its writer".into()))?;
        Ok((writer, fresh))
    }

    /// Record a batch's rows against the open part and the run counters.
    pub(crate) fn add_progress(&mut self, rows: u64) -> Result<()> {
        let Some(part) = self.current.as_mut() else {
            return Ok(());
        };
        let total = part.written.load(Ordering::Relaxed);
        let delta = total.saturating_sub(part.reported_bytes);
        part.reported_bytes = total;
        self.manifest
            .add_progress_to_part(part.part_index, rows, delta)?;
        self.counters.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    /// Rotate when the compressed output crossed the threshold.
    pub(crate) fn maybe_rotate(&mut self) -> Result<()> {
        let Some(limit) = self.rotate_bytes else {
            return Ok(());
        };
        let over = self
            .current
            .as_ref()
            .map(|part| part.written.load(Ordering::Relaxed) >= limit)
            .unwrap_or(false);
        if over {
            self.finalize_current()?;
        }
        Ok(())
    }

    /// Close the codec stream, then the file, then tell the manifest.
    pub(crate) fn finalize_current(&mut self) -> Result<()> {
        let Some(mut part) = self.current.take() else {
            return Ok(());
        };
        let writer = part
            .writer
            .take()
            .ok_or_else(|| SnapshotError::Internal("part sink lost its writer".into()))?;
        let sink = writer.finish()?;
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

/// Infer the output column list from a batch: `_id` first when present,
/// then the union of remaining keys in lexicographic order.
pub(crate) fn infer_columns(docs: &[Document]) -> Vec<String> {
    let mut rest: BTreeSet<String> = BTreeSet::new();
    let mut has_id = false;
    for doc in docs {
        for key in doc.keys() {
            if key == "_id" {
                has_id = true;
            } else {
                rest.insert(key.clone());
            }
        }
    }
    let mut columns = Vec::with_capacity(rest.len() + usize::from(has_id));
    if has_id {
        columns.push("_id".to_string());
    }
    columns.extend(rest);
    columns
}
