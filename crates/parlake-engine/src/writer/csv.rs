//! CSV part writer.
//!
//! Columns are inferred from the first batch (`_id` first, remaining keys
//! in lexicographic order) and frozen for the run; documents that later
//! grow new keys silently drop them. Nested documents and arrays are
//! embedded as JSON strings so the row remains round-trippable. Every
//! rotated part is a standalone CSV file with its own header.

use std::sync::Arc;

use bson::{Bson, Document};
use parlake_types::error::Result;
use parlake_types::format::Compression;
use parlake_types::options::SnapshotOptions;
use parlake_types::value::to_json;

use super::{infer_columns, io_err, CodecFactory, PartSink, PartWriter};
use crate::manifest::ManifestStore;
use crate::queue::BatchPayload;
use crate::telemetry::ProgressCounters;

pub(crate) struct CsvWriter {
    sink: PartSink,
    columns: Option<Vec<String>>,
    emit_header: bool,
}

impl CsvWriter {
    pub(crate) fn new(
        options: &SnapshotOptions,
        effective: Compression,
        factory: CodecFactory,
        manifest: Arc<ManifestStore>,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            sink: PartSink::new(options, effective, factory, manifest, counters),
            columns: None,
            emit_header: options.csv_header,
        }
    }
}

/// Render one cell. Scalars keep their plain text form; nested values
/// become embedded JSON.
fn field(value: Option<&Bson>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    match value {
        Bson::Null | Bson::Undefined => String::new(),
        Bson::String(s) | Bson::Symbol(s) => s.clone(),
        Bson::Document(_) | Bson::Array(_) => to_json(value).to_string(),
        other => match to_json(other) {
            serde_json::Value::String(s) => s,
            json => json.to_string(),
        },
    }
}

impl PartWriter for CsvWriter {
    fn write_batch(&mut self, payload: BatchPayload) -> Result<()> {
        let docs: Vec<Document> = match payload {
            BatchPayload::Documents(docs) => docs,
            BatchPayload::Encoded(_) => {
                return Err(io_err("csv writer received a pre-encoded batch"));
            }
        };
        if docs.is_empty() {
            return Ok(());
        }
        if self.columns.is_none() {
            self.columns = Some(infer_columns(&docs));
        }
        let columns = self
            .columns
            .clone()
            .unwrap_or_default();

        let emit_header = self.emit_header;
        let (writer, fresh) = self.sink.writer()?;
        let mut csv = csv::Writer::from_writer(writer);
        if fresh && emit_header {
            csv.write_record(&columns).map_err(io_err)?;
        }
        for doc in &docs {
            let record: Vec<String> = columns.iter().map(|col| field(doc.get(col))).collect();
            csv.write_record(&record).map_err(io_err)?;
        }
        csv.flush()?;
        drop(csv);

        self.sink.add_progress(docs.len() as u64)?;
        self.sink.maybe_rotate()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.sink.finalize_current()
    }
}
