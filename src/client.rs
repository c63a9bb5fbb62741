use crate::config::ClientConfig;
use crate::latency::LatencyProbe;
use crate::measurements::{
    LatencyResult, PhaseResult, SpeedSample, SpeedTestReport, StopReason, TransferDirection,
};
use crate::orchestrator::{OrchestratorSettings, TransferOrchestrator};
use crate::transport::{HttpTransport, Transport};
use crate::Result;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Progress event types reported during a measurement run.
///
/// These events allow monitoring of test progress in real-time through callbacks.
/// Events are emitted for lifecycle stages, individual latency probes, live
/// throughput ticks and interval samples.
///
/// # Examples
///
/// ```no_run
/// use speedcheck::{ClientConfig, ProgressEvent, SpeedTestClient};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("http://127.0.0.1:3000");
///
/// let client = SpeedTestClient::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         match event {
///             ProgressEvent::TestStarted => println!("Starting..."),
///             ProgressEvent::LiveThroughput { direction, mbps, .. } => {
///                 println!("{}: {:.2} Mbps", direction, mbps);
///             }
///             ProgressEvent::PhaseCompleted { direction, mbps, .. } => {
///                 println!("{} finished at {:.2} Mbps", direction, mbps);
///             }
///             ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
///             _ => {}
///         }
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The run is starting.
    ///
    /// Emitted once before the latency probe.
    TestStarted,
    /// A throughput phase is starting.
    PhaseStarted {
        direction: TransferDirection,
        threads: usize,
    },
    /// One successful latency probe.
    ///
    /// # Fields
    ///
    /// * `index` - Zero-based probe number
    /// * `rtt_ms` - Round-trip time in milliseconds
    LatencySample { index: usize, rtt_ms: f64 },
    /// Monitor tick with the smoothed throughput.
    ///
    /// # Fields
    ///
    /// * `direction` - Phase being measured
    /// * `elapsed` - Time since the phase started
    /// * `bytes` - Bytes transferred so far across all tasks
    /// * `mbps` - Mean of the last three samples, or the running average
    ///   while fewer samples exist
    LiveThroughput {
        direction: TransferDirection,
        elapsed: Duration,
        bytes: u64,
        mbps: f64,
    },
    /// A new interval sample was recorded.
    SpeedSample {
        direction: TransferDirection,
        sample: SpeedSample,
    },
    /// A throughput phase finished with a measurement.
    PhaseCompleted {
        direction: TransferDirection,
        stop_reason: StopReason,
        bytes: u64,
        duration: Duration,
        mbps: f64,
    },
    /// The full run completed.
    ///
    /// # Fields
    ///
    /// * `latency_ms` - Average round-trip time
    /// * `jitter_ms` - Mean absolute difference of consecutive round trips
    /// * `download_mbps` - Final download throughput
    /// * `upload_mbps` - Final upload throughput
    TestCompleted {
        latency_ms: f64,
        jitter_ms: f64,
        download_mbps: f64,
        upload_mbps: f64,
    },
    /// Error occurred during the run.
    ///
    /// Contains a descriptive error message. After this event, the run
    /// terminates.
    Error(String),
}

/// Callback trait for receiving progress updates during a run.
///
/// Implement this trait to receive real-time notifications about test progress.
/// The trait is automatically implemented for any function or closure with the
/// correct signature.
///
/// # Examples
///
/// ## Using a Closure
///
/// ```
/// use speedcheck::{ClientConfig, ProgressEvent, SpeedTestClient};
///
/// let client = SpeedTestClient::new(ClientConfig::default())
///     .unwrap()
///     .with_callback(|event: ProgressEvent| {
///         println!("Event: {:?}", event);
///     });
/// ```
///
/// ## Custom Implementation
///
/// ```
/// use speedcheck::ProgressCallback;
/// use speedcheck::ProgressEvent;
///
/// struct MyCallback;
///
/// impl ProgressCallback for MyCallback {
///     fn on_progress(&self, event: ProgressEvent) {
///         // Custom handling
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    fn on_progress(&self, event: ProgressEvent);
}

/// Simple function-based callback
impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

pub(crate) type CallbackRef = Arc<dyn ProgressCallback>;

/// Measurement client.
///
/// Runs the latency probe, then the download phase, then the upload phase.
/// The phases share only the configuration.
///
/// # Examples
///
/// ## Full run
///
/// ```no_run
/// use speedcheck::{ClientConfig, SpeedTestClient};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("http://192.168.1.100:3000").with_threads(6);
///
/// let client = SpeedTestClient::new(config)?;
/// let report = client.run().await?;
///
/// println!("Ping:     {:.1} ms", report.latency.average_ms);
/// println!("Download: {:.2} Mbps", report.download.speed_mbps);
/// println!("Upload:   {:.2} Mbps", report.upload.speed_mbps);
/// # Ok(())
/// # }
/// ```
///
/// ## Custom transport
///
/// Any [`Transport`] can stand in for HTTP, e.g. to simulate a link.
///
/// ```no_run
/// use speedcheck::{ClientConfig, SpeedTestClient};
/// use speedcheck::transport::HttpTransport;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("http://127.0.0.1:3000");
/// let transport = Arc::new(HttpTransport::new(&config)?);
/// let client = SpeedTestClient::with_transport(config, transport)?;
///
/// let download = client.measure_download().await?;
/// println!("{:?}", download.stop_reason);
/// # Ok(())
/// # }
/// ```
pub struct SpeedTestClient<T: Transport = HttpTransport> {
    config: ClientConfig,
    transport: Arc<T>,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl SpeedTestClient<HttpTransport> {
    /// Creates a client speaking HTTP to `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid, or an HTTP
    /// error if the client cannot be built.
    ///
    /// # Examples
    ///
    /// ```
    /// use speedcheck::{ClientConfig, SpeedTestClient};
    ///
    /// let client = SpeedTestClient::new(ClientConfig::new("http://127.0.0.1:3000"))
    ///     .expect("Failed to create client");
    ///
    /// assert!(SpeedTestClient::new(ClientConfig::default().with_threads(0)).is_err());
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> SpeedTestClient<T> {
    /// Creates a client over an arbitrary transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<T>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            callback: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback to receive real-time updates.
    ///
    /// # Returns
    ///
    /// Returns `self` for method chaining.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Notify callback of progress event
    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it aborts the running phase; the run then fails with
    /// `Error::Cancelled` and no measurement is returned.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use speedcheck::{ClientConfig, SpeedTestClient};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = SpeedTestClient::new(ClientConfig::default())?;
    ///
    /// // Get cancellation token to cancel from another task
    /// let cancel_token = client.cancellation_token().clone();
    ///
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// assert!(client.run().await.is_err());
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    fn orchestrator(&self) -> TransferOrchestrator<T> {
        TransferOrchestrator::new(
            Arc::clone(&self.transport),
            OrchestratorSettings::from_config(&self.config),
        )
        .with_callback_ref(self.callback.clone())
    }

    /// Measures round-trip latency and jitter.
    pub async fn measure_latency(&self) -> Result<LatencyResult> {
        LatencyProbe::new(
            Arc::clone(&self.transport),
            self.config.latency_probes,
            self.config.probe_spacing,
        )
        .with_callback_ref(self.callback.clone())
        .measure(&self.cancellation_token)
        .await
    }

    /// Runs the download phase.
    pub async fn measure_download(&self) -> Result<PhaseResult> {
        self.orchestrator()
            .run_phase(
                TransferDirection::Download,
                self.config.download_threads,
                self.config.download_durations,
                &self.cancellation_token,
            )
            .await
    }

    /// Runs the upload phase.
    pub async fn measure_upload(&self) -> Result<PhaseResult> {
        self.orchestrator()
            .run_phase(
                TransferDirection::Upload,
                self.config.upload_threads,
                self.config.upload_durations,
                &self.cancellation_token,
            )
            .await
    }

    /// Runs latency, download and upload in sequence.
    ///
    /// Progress events are emitted through the callback (if set) during
    /// execution.
    ///
    /// # Errors
    ///
    /// Returns the first error of any stage; a failed stage ends the run.
    pub async fn run(&self) -> Result<SpeedTestReport> {
        info!("Starting speed test against {}", self.config.base_url);
        self.notify(ProgressEvent::TestStarted);

        match self.run_stages().await {
            Ok(report) => {
                self.notify(ProgressEvent::TestCompleted {
                    latency_ms: report.latency.average_ms,
                    jitter_ms: report.latency.jitter_ms,
                    download_mbps: report.download.speed_mbps,
                    upload_mbps: report.upload.speed_mbps,
                });
                Ok(report)
            }
            Err(e) => {
                error!("Speed test failed: {}", e);
                self.notify(ProgressEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_stages(&self) -> Result<SpeedTestReport> {
        let latency = self.measure_latency().await?;
        let download = self.measure_download().await?;
        let upload = self.measure_upload().await?;

        Ok(SpeedTestReport {
            latency,
            download,
            upload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }
}
