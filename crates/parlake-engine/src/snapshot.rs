//! Snapshot orchestrator.
//!
//! Wires the planner, readers, queue, writer, and manifest into one run:
//! plan (or reconstruct) the partition set, fan out one reader task per
//! incomplete partition, consume the queue with a single writer task, and
//! surface the first error after the writer has drained and finalized the
//! part it was writing. Bounded partitions marked complete are never
//! reopened; the unbounded tail partition is re-polled strictly past its
//! checkpoint, so a rerun against an unchanged collection writes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Bson;
use parlake_types::error::{Result, SnapshotError};
use parlake_types::format::Compression;
use parlake_types::manifest::PartRecord;
use parlake_types::options::SnapshotOptions;
use tokio::task::JoinSet;

use crate::manifest::ManifestStore;
use crate::partition::{self, IdRange};
use crate::queue::ByteQueue;
use crate::reader::{run_partition_reader, DocumentMapper, ReaderTask};
use crate::source::DocumentSource;
use crate::telemetry::{ProgressCounters, Telemetry};
use crate::writer::{create_writer, CodecAvailability, CodecFactory};

/// Interval between progress emissions.
const PROGRESS_TICK: Duration = Duration::from_secs(2);

/// Everything a run needs besides the options: the source, telemetry,
/// an optional per-document mapper, the cooperative cancellation flag,
/// and the codec capability lookup.
pub struct SnapshotContext {
    pub source: Arc<dyn DocumentSource>,
    pub telemetry: Telemetry,
    pub mapper: Option<DocumentMapper>,
    pub cancel: Arc<AtomicBool>,
    pub codecs: CodecAvailability,
}

impl SnapshotContext {
    /// Context with default telemetry, no mapper, and all codecs available.
    #[must_use]
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self {
            source,
            telemetry: Telemetry::disabled(),
            mapper: None,
            cancel: Arc::new(AtomicBool::new(false)),
            codecs: CodecAvailability::default(),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct SnapshotReport {
    pub run_id: String,
    /// Whether an existing manifest was resumed.
    pub resumed: bool,
    pub partitions: usize,
    /// Rows written by this run (not cumulative across resumes).
    pub rows_written: u64,
    /// Compressed bytes written by this run.
    pub bytes_written: u64,
    /// Full part ledger, including parts from earlier runs.
    pub parts: Vec<PartRecord>,
    pub effective_compression: Compression,
    pub duration_secs: f64,
}

/// Outcome of `--dry-run`: the plan, with nothing opened or written.
#[derive(Debug)]
pub struct DryRunReport {
    pub partitions: Vec<IdRange>,
    pub estimated_documents: u64,
}

/// Plan partitions and estimate volume without touching the output
/// directory.
///
/// # Errors
///
/// Propagates configuration and source errors.
pub async fn dry_run(
    source: &dyn DocumentSource,
    options: &SnapshotOptions,
) -> Result<DryRunReport> {
    options.validate()?;
    let partitions = partition::plan(source, &options.query, options.partitions).await?;
    let estimated_documents = source.estimated_count().await?;
    Ok(DryRunReport {
        partitions,
        estimated_documents,
    })
}

/// Run one snapshot to completion (or first error).
///
/// # Errors
///
/// Surfaces the first failure after the writer has drained in-flight
/// batches and finalized the part it was writing; checkpoints on disk
/// stay valid for resume.
pub async fn run_snapshot(
    ctx: SnapshotContext,
    options: SnapshotOptions,
) -> Result<SnapshotReport> {
    let started = Instant::now();
    options.validate()?;

    let factory = CodecFactory::with_availability(ctx.codecs.zstd, options.compression_level);
    let effective = factory.effective(options.compression);

    std::fs::create_dir_all(&options.output_dir)?;
    let manifest_path = options
        .output_dir
        .join(format!("{}.manifest.json", options.prefix));
    let (store, resumed) = ManifestStore::load_or_create(manifest_path, &options, effective)?;
    let store = Arc::new(store);

    // Plan on first run; on resume the ranges are reconstructed from the
    // manifest so boundaries stay stable across runs.
    let mut records = store.partitions()?;
    if records.is_empty() {
        let plan = partition::plan(ctx.source.as_ref(), &options.query, options.partitions).await?;
        let uppers: Vec<Option<Bson>> = plan.iter().map(|r| r.upper.clone()).collect();
        store.ensure_partitions(&uppers)?;
        records = store.partitions()?;
    }
    let mut ranges = Vec::with_capacity(records.len());
    let mut lower: Option<Bson> = None;
    for record in &records {
        let upper = record.upper();
        ranges.push(IdRange {
            lower: lower.clone(),
            upper: upper.clone(),
        });
        lower = upper;
    }

    tracing::info!(
        collection = options.collection,
        format = %options.format,
        compression = %effective,
        partitions = records.len(),
        resumed,
        "starting snapshot run"
    );

    let (queue, mut receiver) = ByteQueue::new(options.queue_bytes);
    let counters = Arc::new(ProgressCounters::default());
    let options = Arc::new(options);

    let writer_handle = {
        let options = Arc::clone(&options);
        let store = Arc::clone(&store);
        let counters = Arc::clone(&counters);
        let queue = queue.clone();
        let cancel = Arc::clone(&ctx.cancel);
        tokio::spawn(async move {
            let mut writer = create_writer(&options, effective, factory, store, counters);
            while let Some(item) = receiver.pop().await {
                if let Err(err) = writer.write_batch(item.payload) {
                    // Writer failures are fatal: stop the readers, then
                    // still finalize the current part cleanly.
                    cancel.store(true, Ordering::Relaxed);
                    queue.close();
                    let _ = writer.close();
                    return Err(err);
                }
            }
            writer.close()?;
            Ok::<(), SnapshotError>(())
        })
    };

    let progress_handle = options.telemetry.then(|| {
        let telemetry = ctx.telemetry.clone();
        let counters = Arc::clone(&counters);
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROGRESS_TICK);
            tick.tick().await;
            loop {
                tick.tick().await;
                telemetry.emit(&counters, queue.size_bytes() as u64);
            }
        })
    });

    let mut join_set: JoinSet<Result<usize>> = JoinSet::new();
    for (record, range) in records.iter().zip(ranges) {
        // A bounded partition marked complete is exhausted for good. The
        // unbounded tail resumes past its checkpoint every run.
        if record.completed && record.upper_id.is_some() {
            counters.partitions_completed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let task = ReaderTask {
            index: record.index,
            range,
            source: Arc::clone(&ctx.source),
            queue: queue.clone(),
            manifest: Arc::clone(&store),
            mapper: ctx.mapper.clone(),
            cancel: Arc::clone(&ctx.cancel),
        };
        let options = Arc::clone(&options);
        let index = record.index;
        join_set.spawn(async move { run_partition_reader(task, &options).await.map(|()| index) });
    }

    let mut first_error: Option<SnapshotError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(index)) => {
                counters.partitions_completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(partition = index, "reader finished");
            }
            Ok(Err(err)) => {
                if first_error.is_none() {
                    tracing::error!(error = %err, "partition reader failed");
                    first_error = Some(err);
                    ctx.cancel.store(true, Ordering::Relaxed);
                    join_set.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() && first_error.is_some() => {}
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(SnapshotError::Internal(format!(
                        "reader task panicked: {join_err}"
                    )));
                    ctx.cancel.store(true, Ordering::Relaxed);
                    join_set.abort_all();
                }
            }
        }
    }

    // Readers are done (or aborted): let the writer drain what was queued
    // and finalize its part, even on the error path.
    queue.close();
    let writer_result = writer_handle
        .await
        .map_err(|e| SnapshotError::Internal(format!("writer task panicked: {e}")))?;
    if let Some(handle) = progress_handle {
        handle.abort();
    }
    if let Err(err) = writer_result {
        // A writer failure closes the queue under the readers, so their
        // closed-queue errors are secondary to the real cause.
        if matches!(first_error, None | Some(SnapshotError::Internal(_))) {
            first_error = Some(err);
        }
    }

    store.flush()?;
    if options.telemetry {
        ctx.telemetry.emit(&counters, queue.size_bytes() as u64);
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let manifest = store.snapshot()?;
    let report = SnapshotReport {
        run_id: manifest.run_id.clone(),
        resumed,
        partitions: manifest.partitions.len(),
        rows_written: counters.rows_written.load(Ordering::Relaxed),
        bytes_written: counters.bytes_written.load(Ordering::Relaxed),
        parts: manifest.parts,
        effective_compression: effective,
        duration_secs: started.elapsed().as_secs_f64(),
    };
    tracing::info!(
        run_id = report.run_id,
        rows = report.rows_written,
        bytes = report.bytes_written,
        parts = report.parts.len(),
        duration_secs = report.duration_secs,
        "snapshot run complete"
    );
    Ok(report)
}
