//! End-to-end snapshot scenarios over the in-memory source and real files.
//!
//! These exercise the documented pipeline properties: exact coverage,
//! query filtering, resume without duplicates, incompatible-resume
//! handling, rotation, single-file mode, and codec fallback.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bson::{doc, Document};
use parlake_engine::{
    dry_run, run_snapshot, CodecAvailability, MemorySource, SnapshotContext, SnapshotReport,
};
use parlake_types::format::{Compression, SnapshotFormat};
use parlake_types::manifest::Manifest;
use parlake_types::options::SnapshotOptions;
use tempfile::TempDir;

fn base_options(dir: &TempDir) -> SnapshotOptions {
    let mut options = SnapshotOptions::new("events", dir.path());
    options.compression = Compression::None;
    options.format = SnapshotFormat::Jsonl;
    options.partitions = 4;
    options
}

async fn run(source: &Arc<MemorySource>, options: SnapshotOptions) -> SnapshotReport {
    let ctx = SnapshotContext::new(Arc::clone(source) as Arc<dyn parlake_engine::DocumentSource>);
    run_snapshot(ctx, options).await.expect("snapshot run")
}

fn load_manifest(dir: &TempDir) -> Manifest {
    let raw = std::fs::read_to_string(dir.path().join("events.manifest.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

/// Concatenate all parts in creation order and parse one JSON value per line.
fn read_jsonl_parts(dir: &TempDir, manifest: &Manifest) -> Vec<serde_json::Value> {
    let mut rows = Vec::new();
    for part in &manifest.parts {
        let raw = std::fs::read(dir.path().join(&part.path)).unwrap();
        let text = if part.path.ends_with(".gz") {
            let mut decoder = flate2::read::GzDecoder::new(&raw[..]);
            let mut out = String::new();
            decoder.read_to_string(&mut out).unwrap();
            out
        } else if part.path.ends_with(".zst") {
            String::from_utf8(zstd::decode_all(&raw[..]).unwrap()).unwrap()
        } else {
            String::from_utf8(raw).unwrap()
        };
        for line in text.lines() {
            rows.push(serde_json::from_str(line).unwrap());
        }
    }
    rows
}

#[tokio::test]
async fn jsonl_round_trip_four_partitions() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=1000).map(|i| doc! { "_id": i as i64, "v": i as i64 }),
    ));
    let report = run(&source, base_options(&dir)).await;

    assert_eq!(report.rows_written, 1000);
    let manifest = load_manifest(&dir);
    assert_eq!(manifest.total_rows(), 1000);
    assert!(manifest.parts.iter().all(|p| p.complete));
    assert!(manifest.partitions.iter().all(|p| p.completed));

    let rows = read_jsonl_parts(&dir, &manifest);
    assert_eq!(rows.len(), 1000);
    let values: BTreeSet<i64> = rows.iter().map(|r| r["v"].as_i64().unwrap()).collect();
    assert_eq!(values, (1..=1000).collect::<BTreeSet<i64>>());
}

#[tokio::test]
async fn single_partition_output_is_sorted() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=200).map(|i| doc! { "_id": i as i64 }),
    ));
    let mut options = base_options(&dir);
    options.partitions = 1;
    run(&source, options).await;

    let rows = read_jsonl_parts(&dir, &load_manifest(&dir));
    let ids: Vec<i64> = rows.iter().map(|r| r["_id"].as_i64().unwrap()).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn query_filter_exports_only_matching_documents() {
    let dir = TempDir::new().unwrap();
    let docs = (1..=100).map(|i| {
        let status = if i % 2 == 0 { "active" } else { "inactive" };
        doc! { "_id": i as i64, "status": status, "n": i as i64 }
    });
    let source = Arc::new(MemorySource::new(docs));
    let mut options = base_options(&dir);
    options.query = doc! { "status": "active" };
    let report = run(&source, options).await;

    assert_eq!(report.rows_written, 50);
    let rows = read_jsonl_parts(&dir, &load_manifest(&dir));
    assert_eq!(rows.len(), 50);
    assert!(rows.iter().all(|r| r["status"] == "active"));
}

#[tokio::test]
async fn resume_picks_up_documents_inserted_after_completion() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=50).map(|i| doc! { "_id": i as i64, "active": true }),
    ));
    let first = run(&source, base_options(&dir)).await;
    assert_eq!(first.rows_written, 50);

    source.insert_many((51..=80).map(|i| doc! { "_id": i as i64, "active": true }));
    let second = run(&source, base_options(&dir)).await;
    assert!(second.resumed);
    assert_eq!(second.rows_written, 30);

    let manifest = load_manifest(&dir);
    assert!(manifest.total_rows() >= 80);
    let rows = read_jsonl_parts(&dir, &manifest);
    let ids: Vec<i64> = rows.iter().map(|r| r["_id"].as_i64().unwrap()).collect();
    let unique: BTreeSet<i64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 80, "duplicates were emitted");
    assert_eq!(unique, (1..=80).collect::<BTreeSet<i64>>());
}

#[tokio::test]
async fn rerunning_a_completed_snapshot_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=100).map(|i| doc! { "_id": i as i64 }),
    ));
    run(&source, base_options(&dir)).await;
    let before = load_manifest(&dir);

    let second = run(&source, base_options(&dir)).await;
    assert!(second.resumed);
    assert_eq!(second.rows_written, 0);

    let after = load_manifest(&dir);
    assert_eq!(before.parts, after.parts);
    assert_eq!(before.run_id, after.run_id);
}

#[tokio::test]
async fn incompatible_resume_fails_then_overwrites() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=20).map(|i| doc! { "_id": i as i64, "v": i as i64 }),
    ));
    run(&source, base_options(&dir)).await;

    let mut csv_options = base_options(&dir);
    csv_options.format = SnapshotFormat::Csv;
    let ctx = SnapshotContext::new(Arc::clone(&source) as Arc<dyn parlake_engine::DocumentSource>);
    let err = run_snapshot(ctx, csv_options.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        parlake_types::error::SnapshotError::IncompatibleResume { field: "format", .. }
    ));

    csv_options.resume_overwrite_incompatible = true;
    let report = run(&source, csv_options).await;
    assert!(!report.resumed);
    assert_eq!(report.rows_written, 20);
    let manifest = load_manifest(&dir);
    assert_eq!(manifest.format, SnapshotFormat::Csv);
    // The part ledger was reset along with the manifest.
    assert!(manifest.parts.iter().all(|p| p.path.contains(".csv")));
}

#[tokio::test]
async fn rotation_produces_bounded_parts() {
    let dir = TempDir::new().unwrap();
    let pad = "x".repeat(200);
    let source = Arc::new(MemorySource::new(
        (1..=10_000).map(|i| doc! { "_id": i as i64, "pad": pad.clone() }),
    ));
    let mut options = base_options(&dir);
    options.rotate_bytes = 64 * 1024;
    run(&source, options).await;

    let manifest = load_manifest(&dir);
    assert!(manifest.parts.len() >= 2, "expected rotation");
    for part in &manifest.parts {
        let on_disk = std::fs::metadata(dir.path().join(&part.path)).unwrap().len();
        assert_eq!(on_disk, part.bytes);
        assert!(part.complete);
        assert!(part.checksum.is_some());
    }
    // Rotation only triggers at the threshold, so every non-final part
    // crossed it.
    for part in &manifest.parts[..manifest.parts.len() - 1] {
        assert!(part.bytes >= 64 * 1024, "undersized part: {part:?}");
    }
    assert_eq!(manifest.total_rows(), 10_000);
    assert_eq!(read_jsonl_parts(&dir, &manifest).len(), 10_000);
}

#[tokio::test]
async fn zstd_fallback_records_gzip_and_gz_parts() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=100).map(|i| doc! { "_id": i as i64 }),
    ));
    let mut options = base_options(&dir);
    options.compression = Compression::Zstd;
    let mut ctx = SnapshotContext::new(Arc::clone(&source) as Arc<dyn parlake_engine::DocumentSource>);
    ctx.codecs = CodecAvailability { zstd: false };
    let report = run_snapshot(ctx, options).await.unwrap();

    assert_eq!(report.effective_compression, Compression::Gzip);
    let manifest = load_manifest(&dir);
    assert_eq!(manifest.compression, Compression::Gzip);
    assert!(manifest.parts.iter().all(|p| p.path.ends_with(".jsonl.gz")));
    assert_eq!(read_jsonl_parts(&dir, &manifest).len(), 100);
}

#[tokio::test]
async fn empty_collection_creates_manifest_but_no_parts() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new([]));
    let report = run(&source, base_options(&dir)).await;

    assert_eq!(report.rows_written, 0);
    let manifest = load_manifest(&dir);
    assert!(manifest.parts.is_empty());
    assert!(manifest.partitions.iter().all(|p| p.completed));
    // Only the manifest exists in the output directory.
    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn single_document_yields_one_part_one_row() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new([doc! { "_id": 1_i64, "only": true }]));
    let report = run(&source, base_options(&dir)).await;
    assert_eq!(report.rows_written, 1);
    let manifest = load_manifest(&dir);
    assert_eq!(manifest.parts.len(), 1);
    assert_eq!(manifest.parts[0].rows, 1);
}

#[tokio::test]
async fn more_partitions_than_documents_completes() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=3).map(|i| doc! { "_id": i as i64 }),
    ));
    let mut options = base_options(&dir);
    options.partitions = 10;
    let report = run(&source, options).await;
    assert_eq!(report.rows_written, 3);
    let manifest = load_manifest(&dir);
    assert!(manifest.partitions.iter().all(|p| p.completed));
    assert_eq!(manifest.total_rows(), 3);
}

#[tokio::test]
async fn single_file_mode_emits_exactly_one_file() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=100).map(|i| doc! { "_id": i as i64, "v": i as i64 }),
    ));
    let mut options = base_options(&dir);
    options.format = SnapshotFormat::Csv;
    options.single_file = true;
    options.rotate_bytes = 128; // ignored in single-file mode
    run(&source, options).await;

    let manifest = load_manifest(&dir);
    assert_eq!(manifest.parts.len(), 1);
    assert_eq!(manifest.parts[0].path, "events.csv");
    assert_eq!(manifest.parts[0].rows, 100);
    let body = std::fs::read_to_string(dir.path().join("events.csv")).unwrap();
    assert_eq!(body.lines().count(), 101); // header + rows
}

#[tokio::test]
async fn parquet_snapshot_round_trips() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=100).map(|i| doc! { "_id": i as i64, "v": i as i64 }),
    ));
    let mut options = base_options(&dir);
    options.format = SnapshotFormat::Parquet;
    options.parquet_row_group = 16;
    let report = run(&source, options).await;
    assert_eq!(report.rows_written, 100);

    let manifest = load_manifest(&dir);
    let mut total = 0usize;
    let mut ids = BTreeSet::new();
    for part in &manifest.parts {
        let file = std::fs::File::open(dir.path().join(&part.path)).unwrap();
        let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        for batch in reader {
            let batch = batch.unwrap();
            let col = batch
                .column(0)
                .as_any()
                .downcast_ref::<arrow::array::Int64Array>()
                .unwrap();
            for i in 0..batch.num_rows() {
                ids.insert(col.value(i));
            }
            total += batch.num_rows();
        }
    }
    assert_eq!(total, 100);
    assert_eq!(ids, (1..=100).collect::<BTreeSet<i64>>());
}

#[tokio::test]
async fn cancellation_aborts_without_losing_checkpoints() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=1000).map(|i| doc! { "_id": i as i64 }),
    ));
    let ctx = SnapshotContext::new(Arc::clone(&source) as Arc<dyn parlake_engine::DocumentSource>);
    ctx.cancel.store(true, Ordering::Relaxed);
    let err = run_snapshot(ctx, base_options(&dir)).await.unwrap_err();
    assert!(matches!(err, parlake_types::error::SnapshotError::Cancelled));

    // The manifest survived and a later run completes the snapshot.
    let report = run(&source, base_options(&dir)).await;
    assert_eq!(load_manifest(&dir).total_rows(), 1000);
    assert!(report.resumed);
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(MemorySource::new(
        (1..=100).map(|i| doc! { "_id": i as i64 }),
    ));
    let options = base_options(&dir);
    let report = dry_run(source.as_ref(), &options).await.unwrap();
    assert_eq!(report.estimated_documents, 100);
    assert!(!report.partitions.is_empty());
    assert!(report.partitions[0].lower.is_none());
    assert!(report.partitions.last().unwrap().upper.is_none());
    // Nothing was created.
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}
