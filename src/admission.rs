//! Concurrency gate for transfer requests.
//!
//! Each [`AdmissionController`] owns its own inflight counter. The server
//! holds one in its shared state; tests construct independent instances.

use crate::config::RETRY_AFTER_SECS;
use crate::{Error, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Threshold gate limiting the number of concurrent transfer requests.
///
/// # Examples
///
/// ```
/// use speedcheck::admission::AdmissionController;
///
/// let admission = AdmissionController::new(1);
///
/// let guard = admission.try_admit().unwrap();
/// assert_eq!(admission.inflight(), 1);
/// assert!(admission.try_admit().is_err());
///
/// drop(guard);
/// assert_eq!(admission.inflight(), 0);
/// ```
#[derive(Debug)]
pub struct AdmissionController {
    inflight: Arc<AtomicUsize>,
    max_inflight: usize,
}

impl AdmissionController {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            inflight: Arc::new(AtomicUsize::new(0)),
            max_inflight,
        }
    }

    /// Admits one request if the ceiling has not been reached.
    ///
    /// The check and the increment happen as a single atomic step, so two
    /// racing requests can never both take the last slot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Overloaded` when `max_inflight` requests are already
    /// admitted.
    pub fn try_admit(&self) -> Result<InflightGuard> {
        let admitted = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_inflight).then_some(current + 1)
            });

        match admitted {
            Ok(previous) => {
                debug!("Request admitted ({}/{})", previous + 1, self.max_inflight);
                Ok(InflightGuard {
                    inflight: Arc::clone(&self.inflight),
                    released: AtomicBool::new(false),
                })
            }
            Err(current) => {
                warn!(
                    "Rejecting request: {} of {} transfer slots in use",
                    current, self.max_inflight
                );
                Err(Error::Overloaded {
                    retry_after_secs: RETRY_AFTER_SECS,
                })
            }
        }
    }

    /// Number of currently admitted requests.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }
}

/// Slot held by an admitted request.
///
/// The slot is returned either by an explicit [`release`](Self::release) when
/// the transfer finishes or by dropping the guard when the peer goes away.
/// Whichever happens first wins; the counter is decremented exactly once.
#[derive(Debug)]
pub struct InflightGuard {
    inflight: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl InflightGuard {
    /// Returns the slot. Calling this more than once has no further effect.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.release();
    }
}
