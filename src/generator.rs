//! Server-side random byte stream with backpressure.
//!
//! The generator writes into a [`ChunkSink`]. A write that finds the sink full
//! suspends until the sink has room again, so the amount of buffered data is
//! bounded by the sink's capacity whatever the reader's speed.

use crate::config::{DEFAULT_CHUNK_KB, DEFAULT_DOWNLOAD_MB, MAX_CHUNK_KB, MIB, MIN_CHUNK_KB};
use crate::measurements::{ServerStats, TransferDirection};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Size and chunking of one download response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadParams {
    pub size_bytes: u64,
    pub chunk_bytes: usize,
}

impl DownloadParams {
    /// Builds parameters from raw query values.
    ///
    /// Missing or unparsable values fall back to the defaults (5 MiB, 64 KiB).
    /// The size is then clamped to `[1, max_download_mb]` MiB and the chunk to
    /// `[16, 1024]` KiB. Nothing here is ever an error.
    ///
    /// # Examples
    ///
    /// ```
    /// use speedcheck::generator::DownloadParams;
    ///
    /// let params = DownloadParams::from_query(Some("999"), Some("4"), 50);
    /// assert_eq!(params.size_bytes, 50 * 1024 * 1024);
    /// assert_eq!(params.chunk_bytes, 16 * 1024);
    ///
    /// let params = DownloadParams::from_query(Some("abc"), None, 50);
    /// assert_eq!(params.size_bytes, 5 * 1024 * 1024);
    /// assert_eq!(params.chunk_bytes, 64 * 1024);
    /// ```
    pub fn from_query(size_mb: Option<&str>, chunk_kb: Option<&str>, max_download_mb: u64) -> Self {
        let size_mb = parse_or(size_mb, DEFAULT_DOWNLOAD_MB).clamp(1, max_download_mb.max(1));
        let chunk_kb = parse_or(chunk_kb, DEFAULT_CHUNK_KB).clamp(MIN_CHUNK_KB, MAX_CHUNK_KB);

        Self {
            size_bytes: size_mb * MIB,
            chunk_bytes: (chunk_kb * 1024) as usize,
        }
    }
}

fn parse_or(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Result of a non-blocking write attempt.
#[derive(Debug)]
pub enum TryWrite {
    Written,
    /// The sink has no room; the chunk is handed back
    Full(Bytes),
    Closed,
}

/// Destination of generated chunks.
#[async_trait]
pub trait ChunkSink: Send {
    /// Attempts to write without waiting.
    fn try_write(&mut self, chunk: Bytes) -> TryWrite;

    /// Waits until the sink has room, then writes. Returns `false` if the
    /// reader went away.
    async fn write(&mut self, chunk: Bytes) -> bool;

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl ChunkSink for mpsc::Sender<Bytes> {
    fn try_write(&mut self, chunk: Bytes) -> TryWrite {
        match self.try_send(chunk) {
            Ok(()) => TryWrite::Written,
            Err(TrySendError::Full(chunk)) => TryWrite::Full(chunk),
            Err(TrySendError::Closed(_)) => TryWrite::Closed,
        }
    }

    async fn write(&mut self, chunk: Bytes) -> bool {
        self.send(chunk).await.is_ok()
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Summary of one generated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorOutcome {
    pub bytes_sent: u64,
    pub completed: bool,
    /// Number of times a write had to wait for the sink to drain
    pub backpressure_waits: u64,
}

/// Produces `size_bytes` of random content in `chunk_bytes` pieces.
///
/// # Examples
///
/// ```
/// use speedcheck::generator::{ByteStreamGenerator, DownloadParams};
/// use tokio::sync::mpsc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let params = DownloadParams::from_query(Some("1"), Some("256"), 10);
/// let (mut tx, mut rx) = mpsc::channel::<bytes::Bytes>(1);
///
/// let reader = tokio::spawn(async move {
///     let mut total = 0;
///     while let Some(chunk) = rx.recv().await {
///         total += chunk.len();
///     }
///     total
/// });
///
/// let outcome = ByteStreamGenerator::new(params).run(&mut tx).await;
/// drop(tx);
///
/// assert!(outcome.completed);
/// assert_eq!(reader.await.unwrap(), 1024 * 1024);
/// # }
/// ```
pub struct ByteStreamGenerator {
    params: DownloadParams,
    rng: StdRng,
}

impl ByteStreamGenerator {
    /// Creates a generator. Parameters built by hand are held to the same
    /// bounds as [`DownloadParams::from_query`]: a chunk of 16 KiB to 1 MiB
    /// and at least one byte of content.
    pub fn new(params: DownloadParams) -> Self {
        let params = DownloadParams {
            size_bytes: params.size_bytes.max(1),
            chunk_bytes: params
                .chunk_bytes
                .clamp((MIN_CHUNK_KB * 1024) as usize, (MAX_CHUNK_KB * 1024) as usize),
        };
        Self {
            params,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn params(&self) -> DownloadParams {
        self.params
    }

    /// Streams the content into `sink` until done or until the reader leaves.
    ///
    /// Disconnects are detected at chunk boundaries and end the stream
    /// quietly with `completed == false`.
    pub async fn run<S: ChunkSink + ?Sized>(mut self, sink: &mut S) -> GeneratorOutcome {
        let total = self.params.size_bytes;
        let mut sent = 0u64;
        let mut waits = 0u64;

        while sent < total {
            if sink.is_closed() {
                debug!("Client disconnected during download: sent={} of {}", sent, total);
                break;
            }

            let len = (total - sent).min(self.params.chunk_bytes as u64) as usize;
            let mut buf = vec![0u8; len];
            self.rng.fill_bytes(&mut buf);

            match sink.try_write(Bytes::from(buf)) {
                TryWrite::Written => {}
                TryWrite::Full(chunk) => {
                    waits += 1;
                    if !sink.write(chunk).await {
                        debug!("Client disconnected during download: sent={} of {}", sent, total);
                        break;
                    }
                }
                TryWrite::Closed => {
                    debug!("Client disconnected during download: sent={} of {}", sent, total);
                    break;
                }
            }

            sent += len as u64;
        }

        GeneratorOutcome {
            bytes_sent: sent,
            completed: sent == total,
            backpressure_waits: waits,
        }
    }

    /// Runs the stream and records completed transfers in `stats`.
    pub async fn run_with_stats<S: ChunkSink + ?Sized>(
        self,
        sink: &mut S,
        stats: &ServerStats,
    ) -> GeneratorOutcome {
        let outcome = self.run(sink).await;
        if outcome.completed {
            stats.record(TransferDirection::Download, outcome.bytes_sent);
        }
        outcome
    }
}
