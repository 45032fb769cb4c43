//! Manifest schema: the durable record of a snapshot run.
//!
//! The manifest pins run identity (collection, format, effective
//! compression, query digest), per-partition checkpoints, and the
//! append-only part ledger. It is stored pretty-printed for human
//! inspection; unknown fields are tolerated on read (no
//! `deny_unknown_fields`) so future additions don't break older readers.

use bson::{Bson, Document};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::format::{Compression, SnapshotFormat};
use crate::value::{canonical_json, document_to_json};

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Checkpointed progress of one partition.
///
/// `_id` values are stored as canonical extended JSON so that every BSON
/// key type round-trips losslessly through the JSON manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    pub index: usize,
    /// Planned inclusive upper bound; `None` for the unbounded tail
    /// partition. The lower bound is the previous partition's upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_id: Option<serde_json::Value>,
    /// Last `_id` whose batch was successfully enqueued; resume reads
    /// strictly after it.
    #[serde(default)]
    pub last_id_exclusive: Option<serde_json::Value>,
    #[serde(default)]
    pub completed: bool,
}

impl PartitionCheckpoint {
    #[must_use]
    pub fn new(index: usize, upper: Option<&Bson>) -> Self {
        Self {
            index,
            upper_id: upper.map(bound_to_json),
            last_id_exclusive: None,
            completed: false,
        }
    }

    /// Decode the stored checkpoint back into a BSON `_id`.
    #[must_use]
    pub fn checkpoint(&self) -> Option<Bson> {
        self.last_id_exclusive
            .as_ref()
            .and_then(|v| Bson::try_from(v.clone()).ok())
    }

    /// Decode the planned upper bound.
    #[must_use]
    pub fn upper(&self) -> Option<Bson> {
        self.upper_id
            .as_ref()
            .and_then(|v| Bson::try_from(v.clone()).ok())
    }

    pub fn set_checkpoint(&mut self, last_id: &Bson) {
        self.last_id_exclusive = Some(bound_to_json(last_id));
    }
}

fn bound_to_json(id: &Bson) -> serde_json::Value {
    id.clone().into_canonical_extjson()
}

/// One output file in the append-only part ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub index: usize,
    pub path: String,
    /// On-disk compressed size; exact once `complete` is set.
    pub bytes: u64,
    pub rows: u64,
    pub complete: bool,
    /// SHA-256 of the raw compressed bytes, hex-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// The persisted manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub run_id: String,
    /// RFC-3339 UTC creation time.
    pub created_at: String,
    pub collection: String,
    pub format: SnapshotFormat,
    /// Effective compression (after any availability-driven downgrade).
    pub compression: Compression,
    /// SHA-256 hex of the canonical JSON of `{query, projection}`.
    pub query_digest: String,
    /// Recognized configuration snapshot.
    pub options: serde_json::Value,
    #[serde(default)]
    pub partitions: Vec<PartitionCheckpoint>,
    #[serde(default)]
    pub parts: Vec<PartRecord>,
}

impl Manifest {
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        collection: impl Into<String>,
        format: SnapshotFormat,
        compression: Compression,
        query_digest: impl Into<String>,
        options: serde_json::Value,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            run_id: run_id.into(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            collection: collection.into(),
            format,
            compression,
            query_digest: query_digest.into(),
            options,
            partitions: Vec::new(),
            parts: Vec::new(),
        }
    }

    /// Resumability check: all four identity fields must match.
    #[must_use]
    pub fn compatible_with(
        &self,
        collection: &str,
        format: SnapshotFormat,
        compression: Compression,
        query_digest: &str,
    ) -> bool {
        self.collection == collection
            && self.format == format
            && self.compression == compression
            && self.query_digest == query_digest
    }

    /// Name of the identity field that breaks compatibility, if any.
    #[must_use]
    pub fn incompatibility(
        &self,
        collection: &str,
        format: SnapshotFormat,
        compression: Compression,
        query_digest: &str,
    ) -> Option<(&'static str, String, String)> {
        if self.collection != collection {
            return Some(("collection", self.collection.clone(), collection.into()));
        }
        if self.format != format {
            return Some(("format", self.format.to_string(), format.to_string()));
        }
        if self.compression != compression {
            return Some((
                "compression",
                self.compression.to_string(),
                compression.to_string(),
            ));
        }
        if self.query_digest != query_digest {
            return Some((
                "query_digest",
                self.query_digest.clone(),
                query_digest.into(),
            ));
        }
        None
    }

    /// Idempotent partition initialization; a populated array is kept as-is.
    pub fn ensure_partitions(&mut self, uppers: &[Option<Bson>]) {
        if self.partitions.is_empty() {
            self.partitions = uppers
                .iter()
                .enumerate()
                .map(|(i, upper)| PartitionCheckpoint::new(i, upper.as_ref()))
                .collect();
        }
    }

    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows).sum()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes).sum()
    }
}

/// SHA-256 hex digest of the canonical JSON of `{query, projection}`.
#[must_use]
pub fn query_digest(query: &Document, projection: Option<&Document>) -> String {
    let value = serde_json::json!({
        "query": document_to_json(query),
        "projection": projection.map(document_to_json),
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;
    use bson::{doc, Bson};

    fn sample() -> Manifest {
        Manifest::new(
            "66f0000000000000000000aa",
            "events",
            SnapshotFormat::Jsonl,
            Compression::Zstd,
            "abc123",
            serde_json::json!({"partitions": 4}),
        )
    }

    #[test]
    fn serde_roundtrip() {
        let mut m = sample();
        m.ensure_partitions(&[Some(Bson::Int64(10)), None]);
        m.partitions[0].set_checkpoint(&Bson::Int64(7));
        m.parts.push(PartRecord {
            index: 0,
            path: "events-part-000000.jsonl.zst".into(),
            bytes: 1024,
            rows: 10,
            complete: true,
            checksum: None,
        });
        let json = serde_json::to_string_pretty(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn unknown_fields_tolerated() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["future_field"] = serde_json::json!({"x": 1});
        let back: Manifest = serde_json::from_value(value).unwrap();
        assert_eq!(back.collection, "events");
    }

    #[test]
    fn object_id_checkpoint_roundtrips() {
        let oid = ObjectId::parse_str("65cafe0000000000000000ff").unwrap();
        let mut p = PartitionCheckpoint::new(0, None);
        p.set_checkpoint(&Bson::ObjectId(oid));
        assert_eq!(p.checkpoint(), Some(Bson::ObjectId(oid)));
    }

    #[test]
    fn int_checkpoint_roundtrips() {
        let mut p = PartitionCheckpoint::new(0, Some(&Bson::Int64(99)));
        p.set_checkpoint(&Bson::Int64(42));
        assert_eq!(p.checkpoint(), Some(Bson::Int64(42)));
        assert_eq!(p.upper(), Some(Bson::Int64(99)));
    }

    #[test]
    fn compatibility_requires_all_four() {
        let m = sample();
        assert!(m.compatible_with("events", SnapshotFormat::Jsonl, Compression::Zstd, "abc123"));
        assert!(!m.compatible_with("events", SnapshotFormat::Csv, Compression::Zstd, "abc123"));
        let (field, manifest_val, requested) = m
            .incompatibility("events", SnapshotFormat::Csv, Compression::Zstd, "abc123")
            .unwrap();
        assert_eq!(field, "format");
        assert_eq!(manifest_val, "jsonl");
        assert_eq!(requested, "csv");
    }

    #[test]
    fn ensure_partitions_is_idempotent() {
        let mut m = sample();
        m.ensure_partitions(&[Some(Bson::Int64(5)), None]);
        m.partitions[0].set_checkpoint(&Bson::Int64(3));
        m.ensure_partitions(&[Some(Bson::Int64(50)), None]);
        assert_eq!(m.partitions[0].checkpoint(), Some(Bson::Int64(3)));
        assert_eq!(m.partitions[0].upper(), Some(Bson::Int64(5)));
    }

    #[test]
    fn digest_ignores_key_order_and_pins_content() {
        let a = query_digest(&doc! {"status": "active", "n": 1}, None);
        let b = query_digest(&doc! {"n": 1, "status": "active"}, None);
        // Key order inside the query document is part of document identity in
        // BSON, but canonical JSON sorts it away: the digest pins semantics.
        assert_eq!(a, b);
        let c = query_digest(&doc! {"status": "inactive"}, None);
        assert_ne!(a, c);
        let d = query_digest(&doc! {"status": "active", "n": 1}, Some(&doc! {"_id": 1}));
        assert_ne!(a, d);
    }
}
