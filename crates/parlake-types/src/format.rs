//! Output format and compression selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

/// Default zstd compression level (speed-biased).
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Default gzip compression level (speed-biased).
pub const DEFAULT_GZIP_LEVEL: u32 = 1;

/// Snapshot output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFormat {
    Jsonl,
    Csv,
    Parquet,
}

impl SnapshotFormat {
    /// File extension without a leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SnapshotFormat {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jsonl" => Ok(Self::Jsonl),
            "csv" => Ok(Self::Csv),
            "parquet" => Ok(Self::Parquet),
            other => Err(SnapshotError::config(format!(
                "unknown format `{other}` (expected jsonl, csv, or parquet)"
            ))),
        }
    }
}

/// Output compression codec.
///
/// `Snappy` is only meaningful for Parquet, where the codec lives inside the
/// file; the other codecs wrap the whole output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Zstd,
    Gzip,
    Snappy,
    None,
}

impl Compression {
    /// Outer file suffix including the dot, empty when the stream is not
    /// wrapped (none, or parquet-internal snappy).
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Zstd => ".zst",
            Self::Gzip => ".gz",
            Self::Snappy | Self::None => "",
        }
    }

    /// `true` for codecs that only exist inside the Parquet container.
    #[must_use]
    pub fn parquet_only(self) -> bool {
        matches!(self, Self::Snappy)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Zstd => "zstd",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for Compression {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zstd" => Ok(Self::Zstd),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "none" => Ok(Self::None),
            other => Err(SnapshotError::config(format!(
                "unknown compression `{other}` (expected zstd, gzip, or none)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_and_display() {
        for (s, f) in [
            ("jsonl", SnapshotFormat::Jsonl),
            ("csv", SnapshotFormat::Csv),
            ("parquet", SnapshotFormat::Parquet),
        ] {
            assert_eq!(s.parse::<SnapshotFormat>().unwrap(), f);
            assert_eq!(f.to_string(), s);
        }
        assert!("tsv".parse::<SnapshotFormat>().is_err());
    }

    #[test]
    fn compression_suffixes() {
        assert_eq!(Compression::Zstd.suffix(), ".zst");
        assert_eq!(Compression::Gzip.suffix(), ".gz");
        assert_eq!(Compression::None.suffix(), "");
        assert_eq!(Compression::Snappy.suffix(), "");
    }

    #[test]
    fn compression_serde_is_snake_case() {
        assert_eq!(serde_json::to_string(&Compression::Zstd).unwrap(), "\"zstd\"");
        let back: Compression = serde_json::from_str("\"gzip\"").unwrap();
        assert_eq!(back, Compression::Gzip);
    }

    #[test]
    fn snappy_is_parquet_only() {
        assert!(Compression::Snappy.parquet_only());
        assert!(!Compression::Zstd.parquet_only());
    }
}
