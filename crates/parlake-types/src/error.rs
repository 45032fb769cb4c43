//! Structured error model for snapshot runs.
//!
//! [`SnapshotError`] classifies failures the way operators need to react to
//! them: configuration problems surface before any I/O, incompatible-resume
//! is its own category so the CLI can suggest `--resume-overwrite-incompatible`,
//! and source errors are kept apart from writer/filesystem errors because
//! only the former leave the manifest in a resumable state by construction.

use std::fmt;

/// Convenience alias used across the engine.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Categorized snapshot failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// Invalid or conflicting configuration. Raised before any I/O.
    #[error("config: {0}")]
    Config(String),

    /// An existing manifest disagrees with the invocation on an identity field.
    #[error("incompatible resume: manifest {field} is `{manifest}` but the invocation requests `{requested}`")]
    IncompatibleResume {
        field: &'static str,
        manifest: String,
        requested: String,
    },

    /// A requested compression backend cannot be provided at all.
    ///
    /// Availability-driven zstd → gzip downgrade is a warning, not this error.
    #[error("codec: {0}")]
    Codec(String),

    /// Cursor or network failure while reading from the source.
    ///
    /// The affected partition keeps its last checkpoint; a rerun resumes
    /// strictly after it.
    #[error("source: {0}")]
    Source(String),

    /// Partition planning failed. No partial plan is ever returned.
    #[error("partition planning: {0}")]
    Partition(String),

    /// The manifest on disk could not be read or persisted.
    #[error("manifest: {0}")]
    Manifest(String),

    /// The run was cancelled cooperatively by the caller.
    #[error("snapshot cancelled")]
    Cancelled,

    /// Writer or filesystem failure. Fatal to the run.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding failure (manifest or JSONL serialization).
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Invariant violation inside the engine (mutex poisoning, closed queue).
    #[error("internal: {0}")]
    Internal(String),
}

impl SnapshotError {
    /// Configuration error, surfaced before any I/O.
    #[must_use]
    pub fn config(message: impl fmt::Display) -> Self {
        Self::Config(message.to_string())
    }

    /// Source-side cursor or network error.
    #[must_use]
    pub fn source(message: impl fmt::Display) -> Self {
        Self::Source(message.to_string())
    }

    /// Partition planning error.
    #[must_use]
    pub fn partition(message: impl fmt::Display) -> Self {
        Self::Partition(message.to_string())
    }

    /// Manifest load/persist error.
    #[must_use]
    pub fn manifest(message: impl fmt::Display) -> Self {
        Self::Manifest(message.to_string())
    }

    /// `true` when a rerun of the same command can pick up from the
    /// checkpoints this run left behind.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Source(_) | Self::Io(_) | Self::Cancelled | Self::Internal(_)
        )
    }
}
