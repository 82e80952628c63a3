//! Application-level raw DEFLATE for outbound and inbound messages.
//!
//! Negotiated once per connection at upgrade. Messages at or above the
//! configured threshold travel as binary frames holding the raw DEFLATE
//! stream of the JSON text; smaller ones stay text frames.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;

use crate::config::CompressionConfig;
use crate::metrics::CompressionMetrics;

/// Encoded outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InflateError {
    #[error("Inflated message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Invalid DEFLATE stream: {0}")]
    InvalidData(String),

    #[error("Inflated message is not valid UTF-8")]
    InvalidUtf8,
}

/// Counters shared by every compressing connection
#[derive(Debug, Default)]
pub struct CompressionStats {
    attempts: AtomicU64,
    compressed: AtomicU64,
    skipped: AtomicU64,
    fallbacks: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompressionSnapshot {
    pub attempts: u64,
    pub compressed: u64,
    pub skipped: u64,
    pub fallbacks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Compressed bytes over original bytes, 1.0 before any compression
    pub ratio: f64,
}

impl CompressionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_compressed(&self, original: usize, compressed: usize) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.compressed.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(original as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(compressed as u64, Ordering::Relaxed);
        CompressionMetrics::record_compressed(original, compressed);
    }

    fn record_skipped(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.skipped.fetch_add(1, Ordering::Relaxed);
        CompressionMetrics::record_skipped();
    }

    fn record_fallback(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        CompressionMetrics::record_fallback();
    }

    pub fn snapshot(&self) -> CompressionSnapshot {
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        CompressionSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            compressed: self.compressed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            bytes_in,
            bytes_out,
            ratio: if bytes_in == 0 {
                1.0
            } else {
                bytes_out as f64 / bytes_in as f64
            },
        }
    }
}

/// Per-connection codec for a negotiated compression profile
#[derive(Debug, Clone)]
pub struct Compressor {
    level: u32,
    threshold: usize,
    stats: Arc<CompressionStats>,
}

impl Compressor {
    pub fn new(config: &CompressionConfig, stats: Arc<CompressionStats>) -> Self {
        Self {
            level: config.level.min(9),
            threshold: config.threshold,
            stats,
        }
    }

    /// Decide at upgrade whether this connection compresses.
    ///
    /// Only an explicit `compression=deflate` query parameter opts in. A
    /// `permessage-deflate` extension offer is left to the transport and
    /// never switches the connection to raw-DEFLATE binary frames.
    pub fn negotiate(
        config: &CompressionConfig,
        stats: &Arc<CompressionStats>,
        query: Option<&str>,
    ) -> Option<Self> {
        let requested = query.is_some_and(|q| q.eq_ignore_ascii_case("deflate"));
        (config.enabled && requested).then(|| Self::new(config, Arc::clone(stats)))
    }

    pub fn encode(&self, text: String) -> Payload {
        if text.len() < self.threshold {
            self.stats.record_skipped();
            return Payload::Text(text);
        }

        match deflate(text.as_bytes(), self.level) {
            Ok(compressed) => {
                self.stats.record_compressed(text.len(), compressed.len());
                Payload::Binary(compressed)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Compression failed, sending uncompressed");
                self.stats.record_fallback();
                Payload::Text(text)
            }
        }
    }

    /// Inflate an inbound binary frame, refusing output larger than `limit`
    pub fn inflate(&self, data: &[u8], limit: usize) -> Result<String, InflateError> {
        inflate(data, limit)
    }
}

fn deflate(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

fn inflate(data: &[u8], limit: usize) -> Result<String, InflateError> {
    let mut output = Vec::new();
    DeflateDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut output)
        .map_err(|e| InflateError::InvalidData(e.to_string()))?;

    if output.len() > limit {
        return Err(InflateError::TooLarge { limit });
    }

    String::from_utf8(output).map_err(|_| InflateError::InvalidUtf8)
}
