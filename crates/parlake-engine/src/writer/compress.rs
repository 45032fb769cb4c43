//! Compression backends behind a capability-checked factory.
//!
//! The factory reconciles the requested codec with what is actually
//! available: a zstd request with no zstd backend degrades to gzip with a
//! warning instead of failing the run. The counting sink sits between the
//! codec and the file, so rotation decisions and part checksums both see
//! the raw compressed byte stream.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use parlake_types::error::Result;
use parlake_types::format::{Compression, DEFAULT_GZIP_LEVEL, DEFAULT_ZSTD_LEVEL};
use sha2::{Digest, Sha256};

/// Write-through sink that tracks byte position and a running SHA-256.
pub(crate) struct CountingWriter<W: Write> {
    inner: W,
    written: Arc<AtomicU64>,
    hasher: Sha256,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W, written: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            written,
            hasher: Sha256::new(),
        }
    }

    /// Hex digest of everything written through this sink.
    pub(crate) fn digest_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The file sink every non-Parquet writer goes through.
pub(crate) type FileSink = CountingWriter<BufWriter<File>>;

/// A compressed stream over a part file.
pub(crate) enum CompressedWriter {
    Zstd(zstd::stream::write::Encoder<'static, FileSink>),
    Gzip(GzEncoder<FileSink>),
    Plain(FileSink),
}

impl CompressedWriter {
    /// Finish the codec stream (forcing trailers) and hand back the sink.
    pub(crate) fn finish(self) -> io::Result<FileSink> {
        let mut sink = match self {
            Self::Zstd(encoder) => encoder.finish()?,
            Self::Gzip(encoder) => encoder.finish()?,
            Self::Plain(sink) => sink,
        };
        sink.flush()?;
        Ok(sink)
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Zstd(encoder) => encoder.write(buf),
            Self::Gzip(encoder) => encoder.write(buf),
            Self::Plain(sink) => sink.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Zstd(encoder) => encoder.flush(),
            Self::Gzip(encoder) => encoder.flush(),
            Self::Plain(sink) => sink.flush(),
        }
    }
}

/// Which optional codec backends are present in this process.
#[derive(Debug, Clone, Copy)]
pub struct CodecAvailability {
    pub zstd: bool,
}

impl Default for CodecAvailability {
    fn default() -> Self {
        Self { zstd: true }
    }
}

/// Capability lookup plus stream construction.
#[derive(Debug, Clone, Copy)]
pub struct CodecFactory {
    zstd_available: bool,
    level: Option<i32>,
}

impl CodecFactory {
    /// Factory with every compiled-in backend available.
    #[must_use]
    pub fn new(level: Option<i32>) -> Self {
        Self {
            zstd_available: true,
            level,
        }
    }

    /// Factory with explicit backend availability (used to exercise the
    /// degraded environment).
    #[must_use]
    pub fn with_availability(zstd_available: bool, level: Option<i32>) -> Self {
        Self {
            zstd_available,
            level,
        }
    }

    /// Reconcile the requested codec with availability. Downgrade is a
    /// warning, never an error.
    #[must_use]
    pub fn effective(&self, requested: Compression) -> Compression {
        match requested {
            Compression::Zstd if !self.zstd_available => {
                tracing::warn!("zstd backend unavailable, falling back to gzip");
                Compression::Gzip
            }
            other => other,
        }
    }

    /// Open a compressed stream over a new part file. `written` observes the
    /// raw compressed bytes reaching the file.
    pub(crate) fn open(
        &self,
        path: &Path,
        compression: Compression,
        written: Arc<AtomicU64>,
    ) -> Result<CompressedWriter> {
        let file = File::create(path)?;
        let sink = CountingWriter::new(BufWriter::new(file), written);
        match compression {
            Compression::Zstd => {
                let level = self.level.unwrap_or(DEFAULT_ZSTD_LEVEL);
                Ok(CompressedWriter::Zstd(zstd::stream::write::Encoder::new(
                    sink, level,
                )?))
            }
            Compression::Gzip => {
                let level = self
                    .level
                    .and_then(|l| u32::try_from(l).ok())
                    .map_or(DEFAULT_GZIP_LEVEL, |l| l.min(9));
                Ok(CompressedWriter::Gzip(GzEncoder::new(
                    sink,
                    flate2::Compression::new(level),
                )))
            }
            // Snappy lives inside the Parquet container; at this layer the
            // stream is raw.
            Compression::Snappy | Compression::None => Ok(CompressedWriter::Plain(sink)),
        }
    }
}
