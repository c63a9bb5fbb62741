//! Convergence detection for throughput samples.
//!
//! A measurement phase is considered converged once the most recent interval
//! samples stay close to their mean. The spread is measured as the mean of the
//! squared relative deviations from the window mean.

use crate::config::StabilityConfig;
use log::debug;

/// Decides whether a sequence of throughput samples has settled.
///
/// # Examples
///
/// ```
/// use speedcheck::stability::StabilityDetector;
/// use speedcheck::config::StabilityConfig;
///
/// let detector = StabilityDetector::new(StabilityConfig::default());
///
/// let steady = vec![100.0; 10];
/// assert!(detector.is_stable(&steady));
///
/// let noisy = vec![0.0, 200.0, 0.0, 200.0, 0.0, 200.0];
/// assert!(!detector.is_stable(&noisy));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    config: StabilityConfig,
}

impl StabilityDetector {
    pub fn new(config: StabilityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Returns `true` when the most recent window of samples has converged.
    ///
    /// Fewer than `min_samples` samples are never stable. Otherwise the last
    /// `min(len, window)` samples are examined and the phase is stable when
    /// their relative variance is below `variance_threshold`.
    pub fn is_stable(&self, samples: &[f64]) -> bool {
        if samples.len() < self.config.min_samples.max(1) {
            return false;
        }

        let window = samples.len().min(self.config.window.max(1));
        let recent = &samples[samples.len() - window..];

        match relative_variance(recent) {
            Some(variance) => {
                let stable = variance < self.config.variance_threshold;
                if stable {
                    debug!(
                        "Stability detected: variance={:.4}, threshold={}, window={} samples",
                        variance, self.config.variance_threshold, window
                    );
                }
                stable
            }
            None => false,
        }
    }

    /// Diagnostic score in `[0, 100]` over the full sample set.
    pub fn stability_score(&self, samples: &[f64]) -> f64 {
        stability_score(samples)
    }
}

impl Default for StabilityDetector {
    fn default() -> Self {
        Self::new(StabilityConfig::default())
    }
}

/// Maps the relative variance of all samples to a score in `[0, 100]`.
///
/// Fewer than two samples score 100; a non-positive mean scores 0.
pub fn stability_score(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 100.0;
    }

    match relative_variance(samples) {
        Some(variance) => ((1.0 - variance * 10.0) * 100.0).clamp(0.0, 100.0),
        None => 0.0,
    }
}

/// Mean of `((x - mean) / mean)^2`, or `None` when the mean is not positive.
fn relative_variance(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if mean <= 0.0 || !mean.is_finite() {
        return None;
    }

    let sum = samples
        .iter()
        .map(|x| {
            let diff = (x - mean) / mean;
            diff * diff
        })
        .sum::<f64>();

    Some(sum / samples.len() as f64)
}
