//! Round-trip latency and jitter measurement.

use crate::client::{CallbackRef, ProgressCallback, ProgressEvent};
use crate::measurements::LatencyResult;
use crate::transport::Transport;
use crate::{Error, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Sequential ping prober.
///
/// Failed probes are dropped rather than counted as zero, and jitter is the
/// mean absolute difference between consecutive successful samples.
///
/// # Examples
///
/// ```no_run
/// use speedcheck::latency::LatencyProbe;
/// use speedcheck::transport::HttpTransport;
/// use speedcheck::ClientConfig;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(HttpTransport::new(&ClientConfig::default())?);
/// let probe = LatencyProbe::new(transport, 10, Duration::from_millis(100));
///
/// let result = probe.measure(&CancellationToken::new()).await?;
/// println!("ping {:.1} ms, jitter {:.1} ms", result.average_ms, result.jitter_ms);
/// # Ok(())
/// # }
/// ```
pub struct LatencyProbe<T: Transport> {
    transport: Arc<T>,
    count: usize,
    spacing: Duration,
    callback: Option<CallbackRef>,
}

impl<T: Transport> LatencyProbe<T> {
    pub fn new(transport: Arc<T>, count: usize, spacing: Duration) -> Self {
        Self {
            transport,
            count,
            spacing,
            callback: None,
        }
    }

    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub(crate) fn with_callback_ref(mut self, callback: Option<CallbackRef>) -> Self {
        self.callback = callback;
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Runs the probes one after another.
    ///
    /// Cancellation ends the sequence early; the samples gathered so far are
    /// still used.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoSamples` when not a single probe succeeded.
    pub async fn measure(&self, cancel: &CancellationToken) -> Result<LatencyResult> {
        let mut samples = Vec::with_capacity(self.count);
        let mut failed = 0usize;

        for index in 0..self.count {
            if cancel.is_cancelled() {
                debug!("Latency probing cancelled after {} probes", index);
                break;
            }

            let start = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.transport.ping() => outcome,
            };

            match outcome {
                Ok(()) => {
                    let rtt_ms = start.elapsed().as_secs_f64() * 1000.0;
                    debug!("Ping {}: {:.2} ms", index + 1, rtt_ms);
                    self.notify(ProgressEvent::LatencySample { index, rtt_ms });
                    samples.push(rtt_ms);
                }
                Err(e) => {
                    warn!("Ping {} failed: {}", index + 1, e);
                    failed += 1;
                }
            }

            if index + 1 < self.count {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.spacing) => {}
                }
            }
        }

        let result = LatencyResult::from_samples(samples, failed)
            .ok_or_else(|| Error::NoSamples("no samples collected".to_string()))?;

        info!(
            "Latency: {:.2} ms average, {:.2} ms jitter ({} ok, {} failed)",
            result.average_ms,
            result.jitter_ms,
            result.samples_ms.len(),
            result.failed_probes
        );
        Ok(result)
    }
}
