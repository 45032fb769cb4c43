//! Snapshot engine: partition planning, parallel readers, a byte-bounded
//! queue, format writers with compression and rotation, and a durable
//! resume manifest.
//!
//! Data flows readers → queue → writer → parts + manifest. The orchestrator
//! in [`snapshot`] wires the stages together and owns error propagation.

pub mod manifest;
pub mod partition;
pub mod queue;
pub mod reader;
pub mod snapshot;
pub mod source;
pub mod telemetry;
pub mod writer;

pub use reader::DocumentMapper;
pub use snapshot::{dry_run, run_snapshot, DryRunReport, SnapshotContext, SnapshotReport};
pub use source::{DocumentSource, MemorySource, MongoSource};
pub use telemetry::{Progress, ProgressCallback, Telemetry};
pub use writer::{CodecAvailability, CodecFactory};
