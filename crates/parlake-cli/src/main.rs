mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use parlake_engine::{dry_run, run_snapshot, MongoSource, SnapshotContext};
use parlake_types::error::{Result, SnapshotError};
use parlake_types::format::{Compression, SnapshotFormat};
use parlake_types::options::SnapshotOptions;

#[derive(Parser, Debug)]
#[command(
    name = "parlake",
    version,
    about = "Resumable parallel snapshots of a MongoDB collection to JSONL, CSV, or Parquet"
)]
struct Cli {
    /// MongoDB connection string
    #[arg(long)]
    uri: String,

    /// Database name
    #[arg(long)]
    db: String,

    /// Collection to snapshot
    #[arg(long)]
    collection: String,

    /// Output directory for parts and the manifest
    #[arg(long)]
    output: PathBuf,

    /// Output format: jsonl, csv, or parquet
    #[arg(long, default_value = "jsonl")]
    format: String,

    /// Compression: zstd, gzip, or none
    #[arg(long, default_value = "zstd")]
    compression: String,

    /// Codec level (zstd 1-22, gzip 0-9)
    #[arg(long, env = "PL_ZSTD_LEVEL")]
    compression_level: Option<i32>,

    /// Number of partitions / parallel readers
    #[arg(long, default_value_t = 4)]
    partitions: usize,

    /// Cursor batch size
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Reader-to-writer queue ceiling in MiB
    #[arg(long, default_value_t = 256)]
    queue_mb: u64,

    /// Part rotation threshold in MiB
    #[arg(long, default_value_t = 1024)]
    rotate_mb: u64,

    /// Part rotation threshold in bytes (overrides --rotate-mb)
    #[arg(long)]
    by_size: Option<u64>,

    /// Produce exactly one output file
    #[arg(long)]
    single_file: bool,

    /// Output file prefix (default: the collection name)
    #[arg(long)]
    prefix: Option<String>,

    /// Filter query as extended JSON ($oid and $date supported)
    #[arg(long)]
    query: Option<String>,

    /// Projection as extended JSON
    #[arg(long)]
    projection: Option<String>,

    /// primary, primary_preferred, secondary, secondary_preferred, nearest
    #[arg(long)]
    read_preference: Option<String>,

    /// Read preference tags, k=v[,k=v...]
    #[arg(long)]
    read_tags: Option<String>,

    /// majority, local, linearizable, available, snapshot
    #[arg(long)]
    read_concern: Option<String>,

    /// Suppress server-side cursor timeouts
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    no_cursor_timeout: bool,

    /// Parquet row-group size
    #[arg(long, env = "PL_PARQUET_ROW_GROUP", default_value_t = 10_000)]
    parquet_row_group: usize,

    /// Per-file row ceiling (Parquet)
    #[arg(long)]
    rotate_rows: Option<u64>,

    /// Writer chunk size in MiB (env default: PL_WRITE_CHUNK_BYTES)
    #[arg(long)]
    write_chunk_mb: Option<usize>,

    /// Writer thread count; the pipeline is single-writer, so >1 warns
    #[arg(long, default_value_t = 1)]
    writer_threads: usize,

    /// Periodic progress emission: on or off
    #[arg(long, env = "PL_TELEMETRY", default_value = "on")]
    telemetry: String,

    /// Replace an incompatible manifest instead of failing
    #[arg(long)]
    resume_overwrite_incompatible: bool,

    /// Plan partitions and exit without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_options(cli: &Cli) -> Result<SnapshotOptions> {
    let mut options = SnapshotOptions::new(cli.collection.clone(), cli.output.clone());
    options.format = cli.format.parse::<SnapshotFormat>()?;
    options.compression = cli.compression.parse::<Compression>()?;
    options.compression_level = cli.compression_level;
    options.partitions = cli.partitions;
    options.batch_size = cli.batch_size;
    options.queue_bytes = cli.queue_mb.saturating_mul(config::MIB);
    options.rotate_bytes = cli
        .by_size
        .unwrap_or_else(|| cli.rotate_mb.saturating_mul(config::MIB));
    options.single_file = cli.single_file;
    if let Some(prefix) = &cli.prefix {
        options.prefix = prefix.clone();
    }
    if let Some(query) = &cli.query {
        options.query = config::parse_document("query", query)?;
    }
    if let Some(projection) = &cli.projection {
        options.projection = Some(config::parse_document("projection", projection)?);
    }
    if let Some(mode) = &cli.read_preference {
        options.read_preference = Some(mode.parse()?);
    }
    if let Some(tags) = &cli.read_tags {
        options.read_tags = config::parse_read_tags(tags)?;
    }
    if let Some(level) = &cli.read_concern {
        options.read_concern = Some(level.parse()?);
    }
    options.no_cursor_timeout = cli.no_cursor_timeout;
    options.parquet_row_group = cli.parquet_row_group;
    options.rotate_rows = cli.rotate_rows;
    options.write_chunk_bytes = config::resolve_write_chunk_bytes(
        cli.write_chunk_mb,
        std::env::var("PL_WRITE_CHUNK_BYTES").ok().as_deref(),
    );
    options.resume_overwrite_incompatible = cli.resume_overwrite_incompatible;
    options.telemetry = config::parse_telemetry(&cli.telemetry)?;
    options.validate()?;
    Ok(options)
}

async fn run(cli: Cli) -> Result<()> {
    let options = build_options(&cli)?;
    if cli.writer_threads > 1 {
        tracing::warn!(
            requested = cli.writer_threads,
            "the pipeline has a single serializer/writer; --writer-threads is ignored"
        );
    }

    let source = MongoSource::connect(&cli.uri, &cli.db, &options).await?;

    if cli.dry_run {
        let report = dry_run(&source, &options).await?;
        println!(
            "would snapshot ~{} documents of {}.{} across {} partition(s):",
            report.estimated_documents,
            cli.db,
            options.collection,
            report.partitions.len()
        );
        for (index, range) in report.partitions.iter().enumerate() {
            println!("  partition {index}: {}", range.filter());
        }
        return Ok(());
    }

    let ctx = SnapshotContext::new(Arc::new(source));
    let report = run_snapshot(ctx, options).await?;
    println!(
        "snapshot {} {}: {} rows, {} bytes across {} part(s) in {:.1}s{}",
        report.run_id,
        if report.resumed { "resumed" } else { "complete" },
        report.rows_written,
        report.bytes_written,
        report.parts.len(),
        report.duration_secs,
        if report.rows_written == 0 && report.resumed {
            " (nothing new)"
        } else {
            ""
        }
    );
    Ok(())
}

fn exit_code(err: &SnapshotError) -> i32 {
    match err {
        SnapshotError::Config(_) => 1,
        _ => 2,
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version are not usage errors.
            let code = i32::from(err.use_stderr());
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init(&cli.log_level);

    if let Err(err) = run(cli).await {
        eprintln!("parlake: {err}");
        if err.is_resumable() {
            eprintln!("parlake: checkpoints are saved; rerun the same command to resume");
        }
        std::process::exit(exit_code(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec![
            "parlake",
            "--uri",
            "mongodb://localhost:27017",
            "--db",
            "app",
            "--collection",
            "events",
            "--output",
            "/tmp/out",
        ];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn defaults_build_valid_options() {
        let options = build_options(&parse(&[])).unwrap();
        assert_eq!(options.format, SnapshotFormat::Jsonl);
        assert_eq!(options.compression, Compression::Zstd);
        assert_eq!(options.partitions, 4);
        assert_eq!(options.queue_bytes, 256 * 1024 * 1024);
        assert_eq!(options.prefix, "events");
        assert!(options.telemetry);
    }

    #[test]
    fn by_size_overrides_rotate_mb() {
        let options = build_options(&parse(&["--rotate-mb", "8", "--by-size", "1234"])).unwrap();
        assert_eq!(options.rotate_bytes, 1234);
        let options = build_options(&parse(&["--rotate-mb", "8"])).unwrap();
        assert_eq!(options.rotate_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn query_and_read_options_flow_through() {
        let cli = parse(&[
            "--query",
            r#"{"status": "active"}"#,
            "--read-preference",
            "secondary_preferred",
            "--read-tags",
            "dc=east",
            "--read-concern",
            "majority",
            "--no-cursor-timeout",
            "false",
        ]);
        let options = build_options(&cli).unwrap();
        assert_eq!(options.query.get_str("status").unwrap(), "active");
        assert!(options.read_preference.is_some());
        assert_eq!(options.read_tags, vec![("dc".into(), "east".into())]);
        assert!(options.read_concern.is_some());
        assert!(!options.no_cursor_timeout);
    }

    #[test]
    fn invalid_format_is_a_config_error() {
        let cli = parse(&["--format", "tsv"]);
        let err = build_options(&cli).unwrap_err();
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn runtime_errors_exit_2() {
        assert_eq!(exit_code(&SnapshotError::source("boom")), 2);
        assert_eq!(
            exit_code(&SnapshotError::IncompatibleResume {
                field: "format",
                manifest: "jsonl".into(),
                requested: "csv".into()
            }),
            2
        );
    }

    #[test]
    fn telemetry_off_flag() {
        let options = build_options(&parse(&["--telemetry", "off"])).unwrap();
        assert!(!options.telemetry);
    }
}
