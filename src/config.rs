use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Smallest chunk the download generator will emit, in KiB.
pub const MIN_CHUNK_KB: u64 = 16;

/// Largest chunk the download generator will emit, in KiB.
pub const MAX_CHUNK_KB: u64 = 1024;

/// Chunk size used when the request does not carry a usable one, in KiB.
pub const DEFAULT_CHUNK_KB: u64 = 64;

/// Download size used when the request does not carry a usable one, in MiB.
pub const DEFAULT_DOWNLOAD_MB: u64 = 5;

/// Upper bound accepted for the server's download and upload ceilings, in MiB.
pub const MAX_CONFIGURABLE_MB: u64 = 1000;

/// Hint sent with overload rejections.
pub const RETRY_AFTER_SECS: u64 = 30;

/// Allowed number of parallel transfer tasks per phase.
pub const MIN_THREADS: usize = 1;
pub const MAX_THREADS: usize = 8;

pub const MIB: u64 = 1024 * 1024;

/// Settings for deciding when a throughput phase has converged.
///
/// # Examples
///
/// ```
/// use speedcheck::config::StabilityConfig;
///
/// let stability = StabilityConfig::default();
/// assert_eq!(stability.min_samples, 5);
/// assert_eq!(stability.window, 10);
/// assert_eq!(stability.variance_threshold, 0.05);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Minimum number of interval samples before stability is evaluated
    pub min_samples: usize,

    /// Number of most recent samples examined
    pub window: usize,

    /// Relative variance below which the phase is considered stable
    pub variance_threshold: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            window: 10,
            variance_threshold: 0.05,
        }
    }
}

/// Minimum and maximum run time of a single measurement phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    /// Early termination on stability is never considered before this
    pub min: Duration,

    /// The phase stops once this much time has elapsed
    pub max: Duration,
}

impl PhaseDurations {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

/// Configuration for the measurement server.
///
/// Use the builder methods to customize the defaults.
///
/// # Examples
///
/// ```
/// use speedcheck::ServerConfig;
///
/// let config = ServerConfig::new(3000)
///     .with_max_download_mb(100)
///     .with_max_upload_mb(50)
///     .with_max_inflight_requests(200);
///
/// assert_eq!(config.port, 3000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port number to listen on
    pub port: u16,

    /// Address to bind to (all interfaces when unset)
    pub bind_addr: Option<IpAddr>,

    /// Largest download a single request may ask for, in MiB
    pub max_download_mb: u64,

    /// Largest upload body a single request may carry, in MiB
    pub max_upload_mb: u64,

    /// Number of concurrent transfer requests admitted before rejecting
    pub max_inflight_requests: usize,

    /// Allowed CORS origins, `*` or a comma separated list
    pub cors_origin: String,

    /// Free-form location label reported by the info endpoint
    pub server_location: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            bind_addr: None,
            max_download_mb: 50,
            max_upload_mb: 50,
            max_inflight_requests: 100,
            cors_origin: "*".to_string(),
            server_location: "unknown".to_string(),
        }
    }
}

impl ServerConfig {
    /// Creates a server configuration listening on `port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use speedcheck::ServerConfig;
    ///
    /// let config = ServerConfig::new(8080);
    /// assert_eq!(config.max_download_mb, 50);
    /// ```
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Sets the download ceiling in MiB. Larger requests are clamped to it.
    pub fn with_max_download_mb(mut self, mb: u64) -> Self {
        self.max_download_mb = mb;
        self
    }

    /// Sets the per-request upload ceiling in MiB.
    pub fn with_max_upload_mb(mut self, mb: u64) -> Self {
        self.max_upload_mb = mb;
        self
    }

    /// Sets how many transfer requests may be in flight at once.
    pub fn with_max_inflight_requests(mut self, max: usize) -> Self {
        self.max_inflight_requests = max;
        self
    }

    pub fn with_cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_origin = origin.into();
        self
    }

    pub fn with_server_location(mut self, location: impl Into<String>) -> Self {
        self.server_location = location.into();
        self
    }

    /// Upload ceiling in bytes.
    pub fn upload_limit_bytes(&self) -> u64 {
        self.max_upload_mb * MIB
    }

    /// Checks the configured limits.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` listing every invalid value.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !(1..=MAX_CONFIGURABLE_MB).contains(&self.max_download_mb) {
            errors.push(format!(
                "Invalid max download size: {}MB. Must be between 1 and {}.",
                self.max_download_mb, MAX_CONFIGURABLE_MB
            ));
        }
        if !(1..=MAX_CONFIGURABLE_MB).contains(&self.max_upload_mb) {
            errors.push(format!(
                "Invalid max upload size: {}MB. Must be between 1 and {}.",
                self.max_upload_mb, MAX_CONFIGURABLE_MB
            ));
        }
        if self.max_inflight_requests < 1 {
            errors.push(format!(
                "Invalid max inflight requests: {}. Must be at least 1.",
                self.max_inflight_requests
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }
}

/// Configuration for the measurement client.
///
/// # Examples
///
/// ## Defaults
///
/// ```
/// use speedcheck::ClientConfig;
///
/// let config = ClientConfig::new("http://127.0.0.1:3000");
/// assert_eq!(config.download_threads, 4);
/// assert_eq!(config.upload_threads, 4);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Shorter phases with more streams
///
/// ```
/// use speedcheck::ClientConfig;
/// use speedcheck::config::PhaseDurations;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("http://speed.example.net")
///     .with_threads(8)
///     .with_download_durations(PhaseDurations::new(
///         Duration::from_secs(2),
///         Duration::from_secs(5),
///     ));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the measurement server, without a trailing slash
    pub base_url: String,

    /// Parallel download tasks
    pub download_threads: usize,

    /// Parallel upload tasks
    pub upload_threads: usize,

    pub download_durations: PhaseDurations,

    pub upload_durations: PhaseDurations,

    pub stability: StabilityConfig,

    /// Size requested by each download request, in MiB
    pub download_size_mb: u64,

    /// Chunk size requested from the server, in KiB
    pub chunk_kb: u64,

    /// Body size of each upload request, in MiB
    pub upload_size_mb: u64,

    /// Monitor tick for live throughput updates
    pub update_interval: Duration,

    /// Minimum spacing between interval samples used for stability
    pub sample_interval: Duration,

    /// Extra time a task may run past the phase maximum before it is aborted
    pub grace: Duration,

    /// Number of latency probes
    pub latency_probes: usize,

    /// Pause between latency probes
    pub probe_spacing: Duration,

    /// Connection establishment timeout
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            download_threads: 4,
            upload_threads: 4,
            download_durations: PhaseDurations::new(
                Duration::from_millis(3500),
                Duration::from_secs(8),
            ),
            upload_durations: PhaseDurations::new(Duration::from_secs(3), Duration::from_secs(6)),
            stability: StabilityConfig::default(),
            download_size_mb: 50,
            chunk_kb: 512,
            upload_size_mb: 10,
            update_interval: Duration::from_millis(100),
            sample_interval: Duration::from_millis(500),
            grace: Duration::from_secs(3),
            latency_probes: 10,
            probe_spacing: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration targeting `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Sets the same number of parallel tasks for both directions.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.download_threads = threads;
        self.upload_threads = threads;
        self
    }

    pub fn with_download_threads(mut self, threads: usize) -> Self {
        self.download_threads = threads;
        self
    }

    pub fn with_upload_threads(mut self, threads: usize) -> Self {
        self.upload_threads = threads;
        self
    }

    pub fn with_download_durations(mut self, durations: PhaseDurations) -> Self {
        self.download_durations = durations;
        self
    }

    pub fn with_upload_durations(mut self, durations: PhaseDurations) -> Self {
        self.upload_durations = durations;
        self
    }

    /// Sets the download maximum and derives the upload maximum from it,
    /// keeping the upload phase two seconds shorter (but at least three).
    ///
    /// # Examples
    ///
    /// ```
    /// use speedcheck::ClientConfig;
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::default().with_max_duration(Duration::from_secs(10));
    /// assert_eq!(config.download_durations.max, Duration::from_secs(10));
    /// assert_eq!(config.upload_durations.max, Duration::from_secs(8));
    /// ```
    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.download_durations.max = max;
        self.download_durations.min = self.download_durations.min.min(max);
        let upload_max = max
            .saturating_sub(Duration::from_secs(2))
            .max(Duration::from_secs(3));
        self.upload_durations.max = upload_max;
        self.upload_durations.min = self.upload_durations.min.min(upload_max);
        self
    }

    pub fn with_stability(mut self, stability: StabilityConfig) -> Self {
        self.stability = stability;
        self
    }

    pub fn with_download_size_mb(mut self, mb: u64) -> Self {
        self.download_size_mb = mb;
        self
    }

    pub fn with_chunk_kb(mut self, kb: u64) -> Self {
        self.chunk_kb = kb;
        self
    }

    pub fn with_upload_size_mb(mut self, mb: u64) -> Self {
        self.upload_size_mb = mb;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_latency_probes(mut self, count: usize, spacing: Duration) -> Self {
        self.latency_probes = count;
        self.probe_spacing = spacing;
        self
    }

    /// Upper bound for any single network operation.
    pub fn request_timeout(&self) -> Duration {
        self.download_durations.max.max(self.upload_durations.max) + self.grace
    }

    /// Checks the client settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("Server base URL is required".to_string()));
        }
        for (name, threads) in [
            ("download", self.download_threads),
            ("upload", self.upload_threads),
        ] {
            if !(MIN_THREADS..=MAX_THREADS).contains(&threads) {
                return Err(Error::Config(format!(
                    "Invalid {} thread count: {}. Must be between {} and {}.",
                    name, threads, MIN_THREADS, MAX_THREADS
                )));
            }
        }
        for (name, durations) in [
            ("download", self.download_durations),
            ("upload", self.upload_durations),
        ] {
            if durations.max.is_zero() || durations.min > durations.max {
                return Err(Error::Config(format!(
                    "Invalid {} durations: min {:?} must not exceed max {:?}",
                    name, durations.min, durations.max
                )));
            }
        }
        if self.update_interval.is_zero() || self.sample_interval.is_zero() {
            return Err(Error::Config(
                "Update and sample intervals must be positive".to_string(),
            ));
        }
        if self.stability.min_samples == 0 || self.stability.window == 0 {
            return Err(Error::Config(
                "Stability sample count and window must be positive".to_string(),
            ));
        }
        if self.upload_size_mb == 0 || self.download_size_mb == 0 {
            return Err(Error::Config(
                "Transfer sizes must be at least 1MB".to_string(),
            ));
        }
        if self.latency_probes == 0 {
            return Err(Error::Config(
                "At least one latency probe is required".to_string(),
            ));
        }
        Ok(())
    }
}
