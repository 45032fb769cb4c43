//! Flag and environment resolution helpers.
//!
//! Env defaults (`PL_*`) apply when the matching flag was not given; the
//! flag always wins. Query and projection strings accept extended JSON, so
//! `{"created": {"$gt": {"$date": "2024-01-01T00:00:00Z"}}}` and
//! `{"_id": {"$oid": "..."}}` work from the shell.

use bson::{Bson, Document};
use parlake_types::error::{Result, SnapshotError};
use parlake_types::options::DEFAULT_WRITE_CHUNK_BYTES;

pub const MIB: u64 = 1024 * 1024;

/// Parse an extended-JSON document argument (query, projection).
pub fn parse_document(flag: &str, raw: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| SnapshotError::config(format!("--{flag} is not valid JSON: {e}")))?;
    let bson = Bson::try_from(value)
        .map_err(|e| SnapshotError::config(format!("--{flag} is not a valid query: {e}")))?;
    match bson {
        Bson::Document(doc) => Ok(doc),
        _ => Err(SnapshotError::config(format!(
            "--{flag} must be a JSON object"
        ))),
    }
}

/// Parse `k=v[,k=v...]` read-preference tags.
pub fn parse_read_tags(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| {
                    SnapshotError::config(format!("--read-tags entry `{pair}` is not k=v"))
                })
        })
        .collect()
}

/// Parse the `--telemetry {on|off}` toggle.
pub fn parse_telemetry(raw: &str) -> Result<bool> {
    match raw {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(SnapshotError::config(format!(
            "--telemetry must be on or off, got `{other}`"
        ))),
    }
}

/// Resolve the write chunk size: `--write-chunk-mb` wins over
/// `PL_WRITE_CHUNK_BYTES`, which wins over the default.
pub fn resolve_write_chunk_bytes(flag_mb: Option<usize>, env_bytes: Option<&str>) -> usize {
    if let Some(mb) = flag_mb {
        return mb.saturating_mul(MIB as usize);
    }
    env_bytes
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_WRITE_CHUNK_BYTES)
}
