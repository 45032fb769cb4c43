//! Snapshot run configuration.
//!
//! [`SnapshotOptions`] is a plain value carried through constructors; there
//! is no global configuration state. Defaults are speed-biased for bulk
//! export workloads.

use std::path::PathBuf;
use std::str::FromStr;

use bson::Document;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, SnapshotError};
use crate::format::{Compression, SnapshotFormat};

/// Default number of partitions (reader workers).
pub const DEFAULT_PARTITIONS: usize = 4;

/// Default cursor batch size for non-JSONL formats.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default queue ceiling: 256 MiB of buffered batches.
pub const DEFAULT_QUEUE_BYTES: u64 = 256 * 1024 * 1024;

/// Default rotation threshold: 1 GiB of compressed output per part.
pub const DEFAULT_ROTATE_BYTES: u64 = 1024 * 1024 * 1024;

/// Default upper bound for a single writer `write()` call.
pub const DEFAULT_WRITE_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Default Parquet row-group size.
pub const DEFAULT_PARQUET_ROW_GROUP: usize = 10_000;

/// Reader-side batch buffer threshold before a batch is enqueued.
pub const READER_BUFFER_BYTES: usize = 1024 * 1024;

/// Cursor-sampling threshold multiplier: below `partitions * SAMPLE_PER_PARTITION`
/// estimated documents the planner uses endpoint ranges.
pub const SAMPLE_PER_PARTITION: u64 = 5000;

/// Read preference for source cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadPreferenceMode {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Self::Primary),
            "primary_preferred" => Ok(Self::PrimaryPreferred),
            "secondary" => Ok(Self::Secondary),
            "secondary_preferred" => Ok(Self::SecondaryPreferred),
            "nearest" => Ok(Self::Nearest),
            other => Err(SnapshotError::config(format!(
                "unknown read preference `{other}`"
            ))),
        }
    }
}

/// Read concern level for source cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConcernLevel {
    Majority,
    Local,
    Linearizable,
    Available,
    Snapshot,
}

impl FromStr for ReadConcernLevel {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "majority" => Ok(Self::Majority),
            "local" => Ok(Self::Local),
            "linearizable" => Ok(Self::Linearizable),
            "available" => Ok(Self::Available),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(SnapshotError::config(format!(
                "unknown read concern `{other}`"
            ))),
        }
    }
}

/// Full configuration of one snapshot run.
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Source collection name (recorded in the manifest).
    pub collection: String,
    /// Directory receiving parts and the manifest.
    pub output_dir: PathBuf,
    /// Output file name prefix; defaults to the collection name.
    pub prefix: String,
    pub format: SnapshotFormat,
    pub compression: Compression,
    /// Codec level; `None` means the codec default.
    pub compression_level: Option<i32>,
    /// Number of partitions / reader workers.
    pub partitions: usize,
    /// Cursor batch size (rows) for non-JSONL formats.
    pub batch_size: usize,
    /// Byte ceiling of the reader → writer queue.
    pub queue_bytes: u64,
    /// Compressed-output rotation threshold per part.
    pub rotate_bytes: u64,
    /// Emit exactly one output file instead of rotating.
    pub single_file: bool,
    /// Base query; documents outside it are never read.
    pub query: Document,
    pub projection: Option<Document>,
    /// Index hint; defaults to the `_id` index.
    pub hint: Option<Document>,
    pub read_preference: Option<ReadPreferenceMode>,
    /// Tag sets applied to secondary-capable read preferences.
    pub read_tags: Vec<(String, String)>,
    pub read_concern: Option<ReadConcernLevel>,
    pub no_cursor_timeout: bool,
    pub parquet_row_group: usize,
    /// Optional per-file row ceiling (Parquet).
    pub rotate_rows: Option<u64>,
    /// Upper bound for a single writer `write()` call.
    pub write_chunk_bytes: usize,
    /// Emit a CSV header row.
    pub csv_header: bool,
    /// Replace an incompatible manifest instead of failing.
    pub resume_overwrite_incompatible: bool,
    /// Enable periodic progress emission.
    pub telemetry: bool,
}

impl SnapshotOptions {
    /// Options with defaults for `collection`, writing under `output_dir`.
    #[must_use]
    pub fn new(collection: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let collection = collection.into();
        Self {
            prefix: collection.clone(),
            collection,
            output_dir: output_dir.into(),
            format: SnapshotFormat::Jsonl,
            compression: Compression::Zstd,
            compression_level: None,
            partitions: DEFAULT_PARTITIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_bytes: DEFAULT_QUEUE_BYTES,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            single_file: false,
            query: Document::new(),
            projection: None,
            hint: None,
            read_preference: None,
            read_tags: Vec::new(),
            read_concern: None,
            no_cursor_timeout: true,
            parquet_row_group: DEFAULT_PARQUET_ROW_GROUP,
            rotate_rows: None,
            write_chunk_bytes: DEFAULT_WRITE_CHUNK_BYTES,
            csv_header: true,
            resume_overwrite_incompatible: false,
            telemetry: true,
        }
    }

    /// Check configuration consistency before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Config`] for invalid or conflicting settings.
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(SnapshotError::config("partitions must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(SnapshotError::config("batch size must be at least 1"));
        }
        if self.queue_bytes == 0 {
            return Err(SnapshotError::config("queue ceiling must be positive"));
        }
        if !self.single_file && self.rotate_bytes == 0 {
            return Err(SnapshotError::config(
                "rotation threshold must be positive unless --single-file is set",
            ));
        }
        if self.compression.parquet_only() && self.format != SnapshotFormat::Parquet {
            return Err(SnapshotError::config(format!(
                "compression `{}` is only valid with parquet output",
                self.compression
            )));
        }
        if let Some(level) = self.compression_level {
            let valid = match self.compression {
                Compression::Zstd => (1..=22).contains(&level),
                Compression::Gzip => (0..=9).contains(&level),
                Compression::Snappy | Compression::None => false,
            };
            if !valid {
                return Err(SnapshotError::config(format!(
                    "compression level {level} is out of range for {}",
                    self.compression
                )));
            }
        }
        if self.format == SnapshotFormat::Parquet && self.parquet_row_group == 0 {
            return Err(SnapshotError::config("parquet row group must be at least 1"));
        }
        Ok(())
    }

    /// The recognized-knob snapshot stored in the manifest `options` field.
    ///
    /// Identity fields (collection, format, compression, query) live
    /// elsewhere in the manifest and are deliberately not repeated here.
    #[must_use]
    pub fn recognized(&self) -> serde_json::Value {
        json!({
            "partitions": self.partitions,
            "batch_size": self.batch_size,
            "queue_bytes": self.queue_bytes,
            "rotate_bytes": self.rotate_bytes,
            "single_file": self.single_file,
            "compression_level": self.compression_level,
            "no_cursor_timeout": self.no_cursor_timeout,
            "parquet_row_group": self.parquet_row_group,
            "rotate_rows": self.rotate_rows,
            "write_chunk_bytes": self.write_chunk_bytes,
            "csv_header": self.csv_header,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let opts = SnapshotOptions::new("events", "/tmp/out");
        assert_eq!(opts.prefix, "events");
        assert_eq!(opts.partitions, DEFAULT_PARTITIONS);
        opts.validate().unwrap();
    }

    #[test]
    fn zero_partitions_rejected() {
        let mut opts = SnapshotOptions::new("events", "/tmp/out");
        opts.partitions = 0;
        assert!(matches!(opts.validate(), Err(SnapshotError::Config(_))));
    }

    #[test]
    fn snappy_requires_parquet() {
        let mut opts = SnapshotOptions::new("events", "/tmp/out");
        opts.compression = Compression::Snappy;
        assert!(opts.validate().is_err());
        opts.format = SnapshotFormat::Parquet;
        opts.validate().unwrap();
    }

    #[test]
    fn compression_level_range_checked() {
        let mut opts = SnapshotOptions::new("events", "/tmp/out");
        opts.compression = Compression::Gzip;
        opts.compression_level = Some(9);
        opts.validate().unwrap();
        opts.compression_level = Some(10);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn read_preference_parses() {
        assert_eq!(
            "secondary_preferred".parse::<ReadPreferenceMode>().unwrap(),
            ReadPreferenceMode::SecondaryPreferred
        );
        assert!("backup".parse::<ReadPreferenceMode>().is_err());
    }

    #[test]
    fn recognized_snapshot_has_stable_keys() {
        let opts = SnapshotOptions::new("events", "/tmp/out");
        let snap = opts.recognized();
        assert!(snap.get("rotate_bytes").is_some());
        assert!(snap.get("collection").is_none());
    }
}
