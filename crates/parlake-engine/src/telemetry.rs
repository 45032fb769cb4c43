//! Run telemetry: shared counters and the optional progress callback.
//!
//! The handle is passed explicitly through constructors; there is no
//! process-global state. The orchestrator's progress task samples the
//! counters every couple of seconds and hands a [`Progress`] snapshot to
//! the callback (and to the structured log).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters updated by the writer and orchestrator.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub rows_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub parts_opened: AtomicU64,
    pub partitions_completed: AtomicU64,
}

/// A point-in-time progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes currently buffered in the reader → writer queue.
    pub queue_bytes: u64,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub parts_opened: u64,
    pub partitions_completed: u64,
}

/// Progress callback supplied by the embedding application.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Telemetry handle carried through the engine.
#[derive(Clone, Default)]
pub struct Telemetry {
    on_progress: Option<ProgressCallback>,
}

impl Telemetry {
    /// Telemetry that only logs.
    #[must_use]
    pub fn disabled() -> Self {
        Self { on_progress: None }
    }

    /// Telemetry invoking `callback` on every progress tick.
    #[must_use]
    pub fn with_callback(callback: ProgressCallback) -> Self {
        Self {
            on_progress: Some(callback),
        }
    }

    pub(crate) fn emit(&self, counters: &ProgressCounters, queue_bytes: u64) {
        let progress = Progress {
            queue_bytes,
            rows_written: counters.rows_written.load(Ordering::Relaxed),
            bytes_written: counters.bytes_written.load(Ordering::Relaxed),
            parts_opened: counters.parts_opened.load(Ordering::Relaxed),
            partitions_completed: counters.partitions_completed.load(Ordering::Relaxed),
        };
        tracing::info!(
            queue_bytes = progress.queue_bytes,
            rows_written = progress.rows_written,
            bytes_written = progress.bytes_written,
            parts_opened = progress.parts_opened,
            partitions_completed = progress.partitions_completed,
            "snapshot progress"
        );
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }
}
