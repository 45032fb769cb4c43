//! JSONL part writer.
//!
//! Batches usually arrive pre-serialized from the readers; the writer then
//! only moves bytes, in chunks bounded by `write_chunk_bytes` to keep
//! intermediate allocations flat. Row counts for pre-assembled buffers are
//! inferred by counting newlines, since exactly one newline terminates
//! each document.

use std::io::Write;
use std::sync::Arc;

use parlake_types::error::Result;
use parlake_types::format::Compression;
use parlake_types::options::SnapshotOptions;
use parlake_types::value::document_to_json;

use super::{CodecFactory, PartSink, PartWriter};
use crate::manifest::ManifestStore;
use crate::queue::BatchPayload;
use crate::telemetry::ProgressCounters;

pub(crate) struct JsonlWriter {
    sink: PartSink,
    write_chunk_bytes: usize,
}

impl JsonlWriter {
    pub(crate) fn new(
        options: &SnapshotOptions,
        effective: Compression,
        factory: CodecFactory,
        manifest: Arc<ManifestStore>,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            sink: PartSink::new(options, effective, factory, manifest, counters),
            write_chunk_bytes: options.write_chunk_bytes.max(1),
        }
    }

    fn write_buffer(&mut self, buf: &[u8]) -> Result<u64> {
        if buf.is_empty() {
            return Ok(0);
        }
        let rows = buf.iter().filter(|b| **b == b'\n').count() as u64;
        let (writer, _) = self.sink.writer()?;
        for chunk in buf.chunks(self.write_chunk_bytes) {
            writer.write_all(chunk)?;
        }
        Ok(rows)
    }
}

impl PartWriter for JsonlWriter {
    fn write_batch(&mut self, payload: BatchPayload) -> Result<()> {
        let rows = match payload {
            BatchPayload::Encoded(buf) => self.write_buffer(&buf)?,
            BatchPayload::Documents(docs) => {
                let mut buf = Vec::new();
                for doc in &docs {
                    serde_json::to_writer(&mut buf, &document_to_json(doc))?;
                    buf.push(b'\n');
                }
                self.write_buffer(&buf)?
            }
        };
        if rows > 0 {
            self.sink.add_progress(rows)?;
            self.sink.maybe_rotate()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.sink.finalize_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use parlake_types::format::SnapshotFormat;
    use std::fs;
    use tempfile::TempDir;

    fn writer_with(
        dir: &TempDir,
        configure: impl FnOnce(&mut SnapshotOptions),
    ) -> (JsonlWriter, Arc<ManifestStore>) {
        let mut options = SnapshotOptions::new("events", dir.path());
        options.format = SnapshotFormat::Jsonl;
        options.compression = Compression::None;
        configure(&mut options);
        let (store, _) = ManifestStore::load_or_create(
            dir.path().join("events.manifest.json"),
            &options,
            Compression::None,
        )
        .unwrap();
        let manifest = Arc::new(store);
        let writer = JsonlWriter::new(
            &options,
            Compression::None,
            CodecFactory::new(None),
            Arc::clone(&manifest),
            Arc::new(ProgressCounters::default()),
        );
        (writer, manifest)
    }

    fn encoded(lines: &[&str]) -> BatchPayload {
        let mut buf = Vec::new();
        for line in lines {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        BatchPayload::Encoded(buf)
    }

    #[test]
    fn rows_inferred_from_newlines() {
        let dir = TempDir::new().unwrap();
        let (mut writer, manifest) = writer_with(&dir, |_| {});
        writer
            .write_batch(encoded(&[r#"{"a":1}"#, r#"{"a":2}"#, r#"{"a":3}"#]))
            .unwrap();
        writer.close().unwrap();

        let snapshot = manifest.snapshot().unwrap();
        assert_eq!(snapshot.parts.len(), 1);
        assert_eq!(snapshot.parts[0].rows, 3);
        assert!(snapshot.parts[0].complete);
        let body = fs::read_to_string(dir.path().join(&snapshot.parts[0].path)).unwrap();
        assert_eq!(body.lines().count(), 3);
    }

    #[test]
    fn document_batches_are_serialized() {
        let dir = TempDir::new().unwrap();
        let (mut writer, manifest) = writer_with(&dir, |_| {});
        writer
            .write_batch(BatchPayload::Documents(vec![
                doc! { "_id": 1, "v": "x" },
                doc! { "_id": 2, "v": "y" },
            ]))
            .unwrap();
        writer.close().unwrap();

        let snapshot = manifest.snapshot().unwrap();
        let body = fs::read_to_string(dir.path().join(&snapshot.parts[0].path)).unwrap();
        let first: serde_json::Value = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(first["_id"], 1);
        assert_eq!(first["v"], "x");
    }

    #[test]
    fn rotation_by_compressed_size() {
        let dir = TempDir::new().unwrap();
        let (mut writer, manifest) = writer_with(&dir, |o| o.rotate_bytes = 256);
        let line = format!("{{\"pad\":\"{}\"}}", "x".repeat(120));
        for _ in 0..6 {
            writer.write_batch(encoded(&[&line])).unwrap();
        }
        writer.close().unwrap();

        let snapshot = manifest.snapshot().unwrap();
        assert!(snapshot.parts.len() >= 2, "expected rotation, got {snapshot:?}");
        assert!(snapshot.parts.iter().all(|p| p.complete));
        // Every non-final part crossed the threshold before rotating.
        for part in &snapshot.parts[..snapshot.parts.len() - 1] {
            assert!(part.bytes >= 256);
        }
        assert_eq!(snapshot.total_rows(), 6);
    }

    #[test]
    fn single_file_never_rotates() {
        let dir = TempDir::new().unwrap();
        let (mut writer, manifest) = writer_with(&dir, |o| {
            o.single_file = true;
            o.rotate_bytes = 64;
        });
        let line = format!("{{\"pad\":\"{}\"}}", "y".repeat(200));
        for _ in 0..5 {
            writer.write_batch(encoded(&[&line])).unwrap();
        }
        writer.close().unwrap();

        let snapshot = manifest.snapshot().unwrap();
        assert_eq!(snapshot.parts.len(), 1);
        assert_eq!(snapshot.parts[0].path, "events.jsonl");
        assert_eq!(snapshot.parts[0].rows, 5);
    }

    #[test]
    fn empty_batches_open_no_part() {
        let dir = TempDir::new().unwrap();
        let (mut writer, manifest) = writer_with(&dir, |_| {});
        writer.write_batch(encoded(&[])).unwrap();
        writer.close().unwrap();
        assert!(manifest.snapshot().unwrap().parts.is_empty());
    }

    #[test]
    fn zstd_parts_decode_back() {
        let dir = TempDir::new().unwrap();
        let mut options = SnapshotOptions::new("events", dir.path());
        options.format = SnapshotFormat::Jsonl;
        let (store, _) = ManifestStore::load_or_create(
            dir.path().join("events.manifest.json"),
            &options,
            Compression::Zstd,
        )
        .unwrap();
        let manifest = Arc::new(store);
        let mut writer = JsonlWriter::new(
            &options,
            Compression::Zstd,
            CodecFactory::new(None),
            Arc::clone(&manifest),
            Arc::new(ProgressCounters::default()),
        );
        writer
            .write_batch(encoded(&[r#"{"n":1}"#, r#"{"n":2}"#]))
            .unwrap();
        writer.close().unwrap();

        let snapshot = manifest.snapshot().unwrap();
        assert_eq!(snapshot.parts[0].path, "events-part-000000.jsonl.zst");
        let raw = fs::read(dir.path().join(&snapshot.parts[0].path)).unwrap();
        let decoded = zstd::decode_all(&raw[..]).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap().lines().count(), 2);
        assert_eq!(snapshot.parts[0].bytes, raw.len() as u64);
    }
}
