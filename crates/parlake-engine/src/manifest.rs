//! Durable manifest store with atomic replacement.
//!
//! All mutation goes through one mutex. Every save writes `<path>.tmp`,
//! fsyncs best-effort, then renames over the manifest so a concurrent
//! reader never observes a torn document. Checkpoint and lifecycle
//! operations persist immediately; per-part progress increments are
//! coalesced to roughly one save every two seconds.

use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use bson::Bson;
use parlake_types::error::{Result, SnapshotError};
use parlake_types::format::Compression;
use parlake_types::manifest::{query_digest, Manifest, PartRecord, PartitionCheckpoint};
use parlake_types::options::SnapshotOptions;
use parlake_types::value::cmp_bson;

/// Minimum interval between coalesced progress saves.
const PROGRESS_SAVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct StoreState {
    manifest: Manifest,
    progress_dirty: bool,
    last_progress_save: Instant,
}

/// Mutex-guarded manifest with atomic on-disk persistence.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl ManifestStore {
    /// Load a compatible manifest from `path` or create a fresh one.
    ///
    /// Returns the store and whether an existing run is being resumed.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::IncompatibleResume`] when the existing
    /// manifest disagrees on an identity field and overwrite was not
    /// requested, or a manifest error when the file cannot be read.
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        options: &SnapshotOptions,
        effective_compression: Compression,
    ) -> Result<(Self, bool)> {
        let path = path.into();
        let digest = query_digest(&options.query, options.projection.as_ref());

        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let manifest: Manifest = serde_json::from_str(&raw)
                .map_err(|e| SnapshotError::manifest(format!("{}: {e}", path.display())))?;
            match manifest.incompatibility(
                &options.collection,
                options.format,
                effective_compression,
                &digest,
            ) {
                None => {
                    tracing::info!(
                        run_id = manifest.run_id,
                        path = %path.display(),
                        "resuming existing manifest"
                    );
                    return Ok((Self::with_manifest(path, manifest), true));
                }
                Some((field, manifest_value, requested)) => {
                    if !options.resume_overwrite_incompatible {
                        return Err(SnapshotError::IncompatibleResume {
                            field,
                            manifest: manifest_value,
                            requested,
                        });
                    }
                    tracing::warn!(
                        field,
                        path = %path.display(),
                        "replacing incompatible manifest"
                    );
                }
            }
        }

        let manifest = Manifest::new(
            ObjectId::new().to_hex(),
            options.collection.clone(),
            options.format,
            effective_compression,
            digest,
            options.recognized(),
        );
        let store = Self::with_manifest(path, manifest);
        store.save_now()?;
        Ok((store, false))
    }

    fn with_manifest(path: PathBuf, manifest: Manifest) -> Self {
        Self {
            path,
            state: Mutex::new(StoreState {
                manifest,
                progress_dirty: false,
                last_progress_save: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| SnapshotError::Internal("manifest mutex poisoned".into()))
    }

    /// Atomic persist: tmp write, best-effort fsync, rename.
    fn persist(&self, manifest: &Manifest) -> Result<()> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let body = serde_json::to_vec_pretty(manifest)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            let _ = file.sync_all();
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Persist the current state unconditionally.
    pub fn save_now(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.progress_dirty = false;
        state.last_progress_save = Instant::now();
        let manifest = state.manifest.clone();
        drop(state);
        self.persist(&manifest)
    }

    /// Idempotent partition initialization with planned upper bounds.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub fn ensure_partitions(&self, uppers: &[Option<Bson>]) -> Result<()> {
        let mut state = self.lock()?;
        state.manifest.ensure_partitions(uppers);
        let manifest = state.manifest.clone();
        drop(state);
        self.persist(&manifest)
    }

    /// Snapshot of one partition's checkpoint record.
    pub fn partition(&self, index: usize) -> Result<PartitionCheckpoint> {
        let state = self.lock()?;
        state
            .manifest
            .partitions
            .get(index)
            .cloned()
            .ok_or_else(|| SnapshotError::Internal(format!("no partition {index} in manifest")))
    }

    /// Snapshot of all partition records.
    pub fn partitions(&self) -> Result<Vec<PartitionCheckpoint>> {
        Ok(self.lock()?.manifest.partitions.clone())
    }

    /// Append a new part record, returning its index. Persists immediately.
    pub fn open_part(&self, path: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let index = state.manifest.parts.len();
        state.manifest.parts.push(PartRecord {
            index,
            path: path.to_string(),
            bytes: 0,
            rows: 0,
            complete: false,
            checksum: None,
        });
        let manifest = state.manifest.clone();
        drop(state);
        self.persist(&manifest)?;
        Ok(index)
    }

    /// Add rows/bytes to an open part. Saves are coalesced.
    pub fn add_progress_to_part(&self, index: usize, rows: u64, bytes: u64) -> Result<()> {
        let mut state = self.lock()?;
        let part = state
            .manifest
            .parts
            .get_mut(index)
            .ok_or_else(|| SnapshotError::Internal(format!("no part {index} in manifest")))?;
        part.rows += rows;
        part.bytes += bytes;
        if state.last_progress_save.elapsed() >= PROGRESS_SAVE_INTERVAL {
            state.progress_dirty = false;
            state.last_progress_save = Instant::now();
            let manifest = state.manifest.clone();
            drop(state);
            self.persist(&manifest)?;
        } else {
            state.progress_dirty = true;
        }
        Ok(())
    }

    /// Finalize a part with its exact on-disk size. Persists immediately.
    pub fn complete_part(
        &self,
        index: usize,
        bytes: u64,
        checksum: Option<String>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let part = state
            .manifest
            .parts
            .get_mut(index)
            .ok_or_else(|| SnapshotError::Internal(format!("no part {index} in manifest")))?;
        part.bytes = bytes;
        part.complete = true;
        part.checksum = checksum;
        state.progress_dirty = false;
        state.last_progress_save = Instant::now();
        let manifest = state.manifest.clone();
        drop(state);
        self.persist(&manifest)
    }

    /// Advance a partition checkpoint. Monotonic: a stale value is ignored.
    /// Persists immediately; never throttled.
    pub fn update_partition_checkpoint(&self, index: usize, last_id: &Bson) -> Result<()> {
        let mut state = self.lock()?;
        let partition = state
            .manifest
            .partitions
            .get_mut(index)
            .ok_or_else(|| SnapshotError::Internal(format!("no partition {index} in manifest")))?;
        if let Some(current) = partition.checkpoint() {
            if cmp_bson(last_id, &current) != Ordering::Greater {
                return Ok(());
            }
        }
        partition.set_checkpoint(last_id);
        let manifest = state.manifest.clone();
        drop(state);
        self.persist(&manifest)
    }

    /// Mark a partition's cursor exhausted. Persists immediately.
    pub fn mark_partition_complete(&self, index: usize) -> Result<()> {
        let mut state = self.lock()?;
        let partition = state
            .manifest
            .partitions
            .get_mut(index)
            .ok_or_else(|| SnapshotError::Internal(format!("no partition {index} in manifest")))?;
        partition.completed = true;
        let manifest = state.manifest.clone();
        drop(state);
        self.persist(&manifest)
    }

    /// Clone of the full manifest (for reporting and tests).
    pub fn snapshot(&self) -> Result<Manifest> {
        Ok(self.lock()?.manifest.clone())
    }

    /// Flush coalesced progress if any is pending.
    pub fn flush(&self) -> Result<()> {
        let state = self.lock()?;
        if !state.progress_dirty {
            return Ok(());
        }
        drop(state);
        self.save_now()
    }
}
