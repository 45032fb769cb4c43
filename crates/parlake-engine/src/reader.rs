//! Per-partition reader: streams one `_id` range into the byte queue.
//!
//! The reader owns the serialization fast path for JSONL (documents become
//! newline-terminated JSON bytes here, off the writer's critical path) and
//! the checkpoint discipline: a partition checkpoint only advances after
//! the batch containing it was accepted by the queue, which is what makes
//! resume duplicate-free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::{doc, Bson, Document};
use futures_util::StreamExt;
use parlake_types::error::{Result, SnapshotError};
use parlake_types::format::SnapshotFormat;
use parlake_types::options::{SnapshotOptions, READER_BUFFER_BYTES};
use parlake_types::value::{approx_document_size, document_to_json};

use crate::manifest::ManifestStore;
use crate::partition::IdRange;
use crate::queue::{BatchPayload, ByteQueue, QueueItem};
use crate::source::{and_filters, DocumentSource, FindSpec};

/// Optional per-document transformation applied before serialization.
pub type DocumentMapper = Arc<dyn Fn(Document) -> Document + Send + Sync>;

pub(crate) struct ReaderTask {
    pub index: usize,
    pub range: IdRange,
    pub source: Arc<dyn DocumentSource>,
    pub queue: ByteQueue,
    pub manifest: Arc<ManifestStore>,
    pub mapper: Option<DocumentMapper>,
    pub cancel: Arc<AtomicBool>,
}

enum Accumulator {
    /// JSONL fast path: serialized bytes plus the row count they contain.
    Encoded { buf: Vec<u8>, rows: u64 },
    /// Row batch for the CSV/Parquet writers with approximate byte size.
    Documents { docs: Vec<Document>, bytes: usize },
}

impl Accumulator {
    fn new(format: SnapshotFormat) -> Self {
        match format {
            SnapshotFormat::Jsonl => Self::Encoded {
                buf: Vec::with_capacity(READER_BUFFER_BYTES),
                rows: 0,
            },
            SnapshotFormat::Csv | SnapshotFormat::Parquet => Self::Documents {
                docs: Vec::new(),
                bytes: 0,
            },
        }
    }

    fn add(&mut self, doc: &Document) -> Result<()> {
        match self {
            Self::Encoded { buf, rows } => {
                serde_json::to_writer(&mut *buf, &document_to_json(doc))?;
                buf.push(b'\n');
                *rows += 1;
            }
            Self::Documents { docs, bytes } => {
                *bytes += approx_document_size(doc);
                docs.push(doc.clone());
            }
        }
        Ok(())
    }

    fn ready(&self, batch_size: usize) -> bool {
        match self {
            Self::Encoded { buf, .. } => buf.len() >= READER_BUFFER_BYTES,
            Self::Documents { docs, bytes } => {
                docs.len() >= batch_size || *bytes >= READER_BUFFER_BYTES
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Encoded { rows, .. } => *rows == 0,
            Self::Documents { docs, .. } => docs.is_empty(),
        }
    }

    /// Drain into a queue item, resetting the accumulator.
    fn take(&mut self, partition: usize) -> QueueItem {
        match self {
            Self::Encoded { buf, rows } => {
                let bytes = buf.len();
                let payload = BatchPayload::Encoded(std::mem::take(buf));
                *rows = 0;
                QueueItem {
                    partition,
                    bytes,
                    payload,
                }
            }
            Self::Documents { docs, bytes } => {
                let size = *bytes;
                *bytes = 0;
                QueueItem {
                    partition,
                    bytes: size,
                    payload: BatchPayload::Documents(std::mem::take(docs)),
                }
            }
        }
    }
}

/// Stream one partition: open a sorted cursor past the checkpoint, batch
/// documents into the queue, advance the checkpoint after each successful
/// enqueue, and mark the partition complete on cursor exhaustion.
pub(crate) async fn run_partition_reader(
    task: ReaderTask,
    options: &SnapshotOptions,
) -> Result<()> {
    let checkpoint = task.manifest.partition(task.index)?.checkpoint();
    let checkpoint_fragment = checkpoint
        .as_ref()
        .map(|id| doc! { "_id": { "$gt": id.clone() } })
        .unwrap_or_default();

    let filter = and_filters(vec![
        options.query.clone(),
        task.range.filter(),
        checkpoint_fragment,
    ]);

    let mut spec = FindSpec::ascending(filter);
    spec.projection = options.projection.clone();
    spec.hint = Some(options.hint.clone().unwrap_or_else(|| doc! { "_id": 1 }));
    spec.batch_size = u32::try_from(options.batch_size).ok();
    spec.no_cursor_timeout = options.no_cursor_timeout;

    let mut stream = task.source.find(spec).await?;
    let mut acc = Accumulator::new(options.format);
    let mut last_seen: Option<Bson> = None;
    let mut rows_read = 0u64;

    while let Some(next) = stream.next().await {
        if task.cancel.load(Ordering::Relaxed) {
            return Err(SnapshotError::Cancelled);
        }
        let doc = next?;
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| SnapshotError::source("document without _id in sorted cursor"))?;
        last_seen = Some(id);
        rows_read += 1;

        let doc = match &task.mapper {
            Some(mapper) => mapper(doc),
            None => doc,
        };
        acc.add(&doc)?;

        if acc.ready(options.batch_size) {
            flush(&task, &mut acc, last_seen.as_ref()).await?;
        }
    }

    if !acc.is_empty() {
        flush(&task, &mut acc, last_seen.as_ref()).await?;
    }
    task.manifest.mark_partition_complete(task.index)?;
    tracing::info!(
        partition = task.index,
        rows = rows_read,
        "partition complete"
    );
    Ok(())
}

async fn flush(task: &ReaderTask, acc: &mut Accumulator, last_seen: Option<&Bson>) -> Result<()> {
    let item = acc.take(task.index);
    let bytes = item.bytes;
    task.queue.push(item).await?;
    if let Some(last_id) = last_seen {
        task.manifest
            .update_partition_checkpoint(task.index, last_id)?;
    }
    tracing::debug!(partition = task.index, bytes, "batch enqueued");
    Ok(())
}
