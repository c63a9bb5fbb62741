use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Converts a byte count over a duration to megabits per second.
///
/// # Examples
///
/// ```
/// use speedcheck::measurements::mbps;
/// use std::time::Duration;
///
/// assert_eq!(mbps(1_250_000, Duration::from_secs(1)), 10.0);
/// assert_eq!(mbps(1_000, Duration::ZERO), 0.0);
/// ```
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / secs / 1_000_000.0
    } else {
        0.0
    }
}

/// Direction of a throughput phase, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Download,
    Upload,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Download => write!(f, "download"),
            TransferDirection::Upload => write!(f, "upload"),
        }
    }
}

/// Why a throughput phase stopped.
///
/// A session starts in `Running` and moves to exactly one of the other
/// variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Running,
    Stabilized,
    MaxDurationReached,
    Cancelled,
    Error,
}

impl StopReason {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StopReason::Running)
    }
}

/// Byte count owned by a single transfer task.
///
/// Clones share the same counter. The owning task is the only writer; the
/// phase monitor reads snapshots without locking.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter {
    bytes: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// One interval throughput observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    /// Time since phase start at the end of the interval
    pub elapsed_ms: u64,
    pub mbps: f64,
}

/// Terminal state of one transfer task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadResult {
    pub thread_id: usize,
    pub bytes: u64,
    /// Completion time relative to phase start
    pub completed_after: Duration,
    /// Number of requests this task finished or abandoned
    pub requests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a download or upload phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub direction: TransferDirection,
    pub thread_count: usize,
    pub stop_reason: StopReason,
    pub bytes_transferred: u64,
    /// From phase start to the last task completion
    pub duration: Duration,
    pub speed_mbps: f64,
    pub samples: Vec<SpeedSample>,
    /// Diagnostic convergence score in `[0, 100]`
    pub stability: f64,
    pub threads: Vec<ThreadResult>,
}

/// Round-trip statistics from the latency probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyResult {
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Mean absolute difference between consecutive samples
    pub jitter_ms: f64,
    pub samples_ms: Vec<f64>,
    pub failed_probes: usize,
}

impl LatencyResult {
    /// Builds statistics from successful round-trip samples.
    ///
    /// Returns `None` when there are no samples.
    pub fn from_samples(samples_ms: Vec<f64>, failed_probes: usize) -> Option<Self> {
        if samples_ms.is_empty() {
            return None;
        }

        let average_ms = samples_ms.iter().sum::<f64>() / samples_ms.len() as f64;
        let min_ms = samples_ms.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = samples_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            average_ms,
            min_ms,
            max_ms,
            jitter_ms: jitter(&samples_ms),
            samples_ms,
            failed_probes,
        })
    }
}

/// Mean absolute difference between consecutive samples.
///
/// This is deliberately not a standard deviation: a steady drift scores a
/// constant jitter, while an alternating pattern scores high.
///
/// # Examples
///
/// ```
/// use speedcheck::measurements::jitter;
///
/// assert_eq!(jitter(&[10.0, 20.0, 15.0]), 7.5);
/// assert_eq!(jitter(&[12.0]), 0.0);
/// ```
pub fn jitter(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }

    let sum: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    sum / (samples.len() - 1) as f64
}

/// Coarse rating of a measured value for display.
///
/// # Examples
///
/// ```
/// use speedcheck::measurements::{Quality, TransferDirection};
///
/// assert_eq!(Quality::of_speed(120.0, TransferDirection::Download), Quality::Excellent);
/// assert_eq!(Quality::of_speed(30.0, TransferDirection::Upload), Quality::Good);
/// assert_eq!(Quality::of_latency(75.0).to_string(), "Average");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Excellent,
    Good,
    Average,
    /// Throughput below the average band
    Slow,
    /// Latency above the average band
    High,
    /// Jitter above the average band
    Unstable,
}

impl Quality {
    /// Upload bands are half the download bands, except the lowest.
    pub fn of_speed(mbps: f64, direction: TransferDirection) -> Self {
        let (excellent, good, average) = match direction {
            TransferDirection::Download => (100.0, 50.0, 25.0),
            TransferDirection::Upload => (50.0, 25.0, 10.0),
        };
        if mbps >= excellent {
            Quality::Excellent
        } else if mbps >= good {
            Quality::Good
        } else if mbps >= average {
            Quality::Average
        } else {
            Quality::Slow
        }
    }

    pub fn of_latency(ms: f64) -> Self {
        match ms {
            ms if ms <= 20.0 => Quality::Excellent,
            ms if ms <= 50.0 => Quality::Good,
            ms if ms <= 100.0 => Quality::Average,
            _ => Quality::High,
        }
    }

    pub fn of_jitter(ms: f64) -> Self {
        match ms {
            ms if ms <= 5.0 => Quality::Excellent,
            ms if ms <= 15.0 => Quality::Good,
            ms if ms <= 30.0 => Quality::Average,
            _ => Quality::Unstable,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Quality::Excellent => "Excellent",
            Quality::Good => "Good",
            Quality::Average => "Average",
            Quality::Slow => "Slow",
            Quality::High => "High",
            Quality::Unstable => "Unstable",
        };
        f.write_str(label)
    }
}

/// Server-side byte totals for completed transfers.
#[derive(Debug, Default)]
pub struct ServerStats {
    download_bytes: AtomicU64,
    upload_bytes: AtomicU64,
    downloads_completed: AtomicU64,
    uploads_completed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatsSnapshot {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub downloads_completed: u64,
    pub uploads_completed: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, direction: TransferDirection, bytes: u64) {
        let (total, count) = match direction {
            TransferDirection::Download => (&self.download_bytes, &self.downloads_completed),
            TransferDirection::Upload => (&self.upload_bytes, &self.uploads_completed),
        };
        total.fetch_add(bytes, Ordering::Relaxed);
        count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
            upload_bytes: self.upload_bytes.load(Ordering::Relaxed),
            downloads_completed: self.downloads_completed.load(Ordering::Relaxed),
            uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
        }
    }
}

/// Full result of a latency, download and upload run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedTestReport {
    pub latency: LatencyResult,
    pub download: PhaseResult,
    pub upload: PhaseResult,
    /// Milliseconds since the Unix epoch when the run finished
    pub timestamp: i64,
}
