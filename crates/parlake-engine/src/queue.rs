//! Bounded byte-queue between readers and the writer.
//!
//! FIFO over an unbounded channel, with capacity enforced by a semaphore
//! whose permits are bytes: `push` acquires the item's byte count (blocking
//! while the queue is over the ceiling), `pop` returns the permits. The
//! semaphore's fair waiter queue preserves push order among blocked
//! readers. An item larger than the whole ceiling is clamped so it can be
//! admitted alone instead of deadlocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bson::Document;
use parlake_types::error::{Result, SnapshotError};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;

/// One enqueued batch.
#[derive(Debug)]
pub struct QueueItem {
    /// Partition that produced the batch.
    pub partition: usize,
    /// Byte count used for accounting.
    pub bytes: usize,
    pub payload: BatchPayload,
}

/// Batch content, shaped by the output format.
#[derive(Debug)]
pub enum BatchPayload {
    /// Pre-serialized newline-terminated JSONL bytes (reader fast path).
    Encoded(Vec<u8>),
    /// Raw documents for the CSV and Parquet writers.
    Documents(Vec<Document>),
}

struct Shared {
    permits: Semaphore,
    capacity: usize,
    size: AtomicUsize,
    tx: Mutex<Option<mpsc::UnboundedSender<QueueItem>>>,
}

fn permits_for(bytes: usize, capacity: usize) -> u32 {
    u32::try_from(bytes.clamp(1, capacity)).unwrap_or(u32::MAX)
}

/// Producer half; clone one per reader.
#[derive(Clone)]
pub struct ByteQueue {
    shared: Arc<Shared>,
}

/// Consumer half, owned by the single writer.
pub struct ByteQueueReceiver {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<QueueItem>,
}

impl ByteQueue {
    /// Create a queue with the given byte ceiling.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> (Self, ByteQueueReceiver) {
        let capacity = usize::try_from(capacity_bytes).unwrap_or(usize::MAX).max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            // Semaphore permits are capped well below usize::MAX.
            permits: Semaphore::new(capacity.min(Semaphore::MAX_PERMITS)),
            capacity: capacity.min(Semaphore::MAX_PERMITS),
            size: AtomicUsize::new(0),
            tx: Mutex::new(Some(tx)),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ByteQueueReceiver { shared, rx },
        )
    }

    /// Enqueue a batch, waiting while the queue is over its byte ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Internal`] if the queue was closed.
    pub async fn push(&self, item: QueueItem) -> Result<()> {
        let need = permits_for(item.bytes, self.shared.capacity);
        let permit = self
            .shared
            .permits
            .acquire_many(need)
            .await
            .map_err(|_| SnapshotError::Internal("push on closed queue".into()))?;
        permit.forget();

        let sender = {
            let guard = self
                .shared
                .tx
                .lock()
                .map_err(|_| SnapshotError::Internal("queue lock poisoned".into()))?;
            guard.clone()
        };
        let Some(sender) = sender else {
            self.shared.permits.add_permits(need as usize);
            return Err(SnapshotError::Internal("push on closed queue".into()));
        };

        self.shared.size.fetch_add(item.bytes, Ordering::SeqCst);
        let bytes = item.bytes;
        if sender.send(item).is_err() {
            self.shared.size.fetch_sub(bytes, Ordering::SeqCst);
            self.shared.permits.add_permits(need as usize);
            return Err(SnapshotError::Internal(
                "queue receiver dropped before close".into(),
            ));
        }
        Ok(())
    }

    /// Close the queue: further pushes fail, pops drain then end.
    /// Idempotent.
    pub fn close(&self) {
        if let Ok(mut guard) = self.shared.tx.lock() {
            guard.take();
        }
        self.shared.permits.close();
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.shared.size.load(Ordering::SeqCst)
    }
}

impl ByteQueueReceiver {
    /// Dequeue the next batch; `None` once the queue is closed and drained.
    pub async fn pop(&mut self) -> Option<QueueItem> {
        let item = self.rx.recv().await?;
        self.shared.size.fetch_sub(item.bytes, Ordering::SeqCst);
        let need = permits_for(item.bytes, self.shared.capacity);
        self.shared.permits.add_permits(need as usize);
        Some(item)
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.shared.size.load(Ordering::SeqCst)
    }
}
