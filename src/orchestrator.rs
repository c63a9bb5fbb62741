//! Multi-stream throughput measurement.
//!
//! A phase spawns one tokio task per stream. Each task owns a [`ByteCounter`]
//! and keeps issuing requests through the [`Transport`] until the session
//! stops. A monitor loop sums the counters on a fixed tick, publishes live
//! throughput, collects interval samples and stops the session once the
//! samples have converged or the maximum duration is reached.
//!
//! Cancellation uses a token tree: the caller's token is the parent of the
//! session abort token, which is the parent of the session stop token.
//! Stopping ends download reads and prevents new requests; aborting also
//! interrupts uploads in flight.

use crate::client::{CallbackRef, ProgressCallback, ProgressEvent};
use crate::config::{ClientConfig, PhaseDurations, StabilityConfig, MIB};
use crate::measurements::{
    mbps, ByteCounter, PhaseResult, SpeedSample, StopReason, ThreadResult, TransferDirection,
};
use crate::stability::{stability_score, StabilityDetector};
use crate::transport::Transport;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Size of the random block repeated to build upload payloads.
pub const UPLOAD_BLOCK_BYTES: usize = 64 * 1024;

/// Number of recent samples averaged for the live throughput display.
const LIVE_SMOOTHING_SAMPLES: usize = 3;

/// Lifecycle of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Preparing,
    Running,
    Stopped(StopReason),
}

/// Timing and sizing knobs of the measurement engine.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Monitor tick
    pub update_interval: Duration,
    /// Minimum spacing between interval samples
    pub sample_interval: Duration,
    /// Time a task may run past the phase maximum before it is aborted
    pub grace: Duration,
    pub stability: StabilityConfig,
    /// Body size of each upload request
    pub upload_size_bytes: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            update_interval: config.update_interval,
            sample_interval: config.sample_interval,
            grace: config.grace,
            stability: config.stability,
            upload_size_bytes: (config.upload_size_mb * MIB) as usize,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Live bookkeeping of one phase.
///
/// Created when a phase starts and consumed into a [`PhaseResult`]. Samples
/// are append-only and the stop reason leaves `Running` at most once.
#[derive(Debug)]
pub struct TransferSession {
    direction: TransferDirection,
    started_at: Instant,
    counters: Vec<ByteCounter>,
    samples: Vec<SpeedSample>,
    stop_reason: StopReason,
}

impl TransferSession {
    pub fn new(direction: TransferDirection, thread_count: usize, started_at: Instant) -> Self {
        Self {
            direction,
            started_at,
            counters: (0..thread_count).map(|_| ByteCounter::new()).collect(),
            samples: Vec::new(),
            stop_reason: StopReason::Running,
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn thread_count(&self) -> usize {
        self.counters.len()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn counter(&self, thread_id: usize) -> Option<&ByteCounter> {
        self.counters.get(thread_id)
    }

    /// Sum of all task counters at this instant.
    pub fn total_bytes(&self) -> u64 {
        self.counters.iter().map(ByteCounter::get).sum()
    }

    pub fn samples(&self) -> &[SpeedSample] {
        &self.samples
    }

    /// Sample throughputs in Mbps, oldest first.
    pub fn rates(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.mbps).collect()
    }

    /// Appends an interval sample. Zero-progress intervals are discarded.
    ///
    /// Returns `true` if a sample was recorded.
    pub fn record_interval(&mut self, gained_bytes: u64, interval: Duration, at: Instant) -> bool {
        if gained_bytes == 0 || interval.is_zero() {
            return false;
        }
        self.samples.push(SpeedSample {
            elapsed_ms: at.saturating_duration_since(self.started_at).as_millis() as u64,
            mbps: mbps(gained_bytes, interval),
        });
        true
    }

    /// Smoothed throughput for display.
    ///
    /// The mean of the last three samples once that many exist, otherwise the
    /// average since the start of the phase.
    pub fn live_mbps(&self, now: Instant) -> f64 {
        if self.samples.len() >= LIVE_SMOOTHING_SAMPLES {
            let recent = &self.samples[self.samples.len() - LIVE_SMOOTHING_SAMPLES..];
            recent.iter().map(|s| s.mbps).sum::<f64>() / LIVE_SMOOTHING_SAMPLES as f64
        } else {
            mbps(
                self.total_bytes(),
                now.saturating_duration_since(self.started_at),
            )
        }
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Moves the session out of `Running`.
    ///
    /// Returns `false` and leaves the session untouched if it already
    /// stopped or if `reason` is `Running`.
    pub fn stop(&mut self, reason: StopReason) -> bool {
        if self.stop_reason.is_terminal() || !reason.is_terminal() {
            return false;
        }
        self.stop_reason = reason;
        true
    }
}

/// Runs download and upload phases over a [`Transport`].
///
/// # Examples
///
/// ```no_run
/// use speedcheck::orchestrator::{OrchestratorSettings, TransferOrchestrator};
/// use speedcheck::transport::HttpTransport;
/// use speedcheck::measurements::TransferDirection;
/// use speedcheck::config::PhaseDurations;
/// use speedcheck::ClientConfig;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("http://127.0.0.1:3000");
/// let transport = Arc::new(HttpTransport::new(&config)?);
/// let orchestrator = TransferOrchestrator::new(transport, OrchestratorSettings::from_config(&config));
///
/// let result = orchestrator
///     .run_phase(
///         TransferDirection::Download,
///         4,
///         PhaseDurations::new(Duration::from_secs(3), Duration::from_secs(8)),
///         &CancellationToken::new(),
///     )
///     .await?;
/// println!("{:.2} Mbps ({:?})", result.speed_mbps, result.stop_reason);
/// # Ok(())
/// # }
/// ```
pub struct TransferOrchestrator<T: Transport> {
    transport: Arc<T>,
    settings: OrchestratorSettings,
    state: Mutex<PhaseState>,
    session_abort: Mutex<Option<CancellationToken>>,
    active_tasks: Arc<AtomicUsize>,
    callback: Option<CallbackRef>,
}

/// Resets the orchestrator to `Idle` however `run_phase` exits.
struct IdleOnExit<'a> {
    state: &'a Mutex<PhaseState>,
    session_abort: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        *self.session_abort.lock() = None;
        *self.state.lock() = PhaseState::Idle;
    }
}

/// Keeps the live task count accurate even if a task is aborted.
struct ActiveTask(Arc<AtomicUsize>);

impl ActiveTask {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Transport> TransferOrchestrator<T> {
    pub fn new(transport: Arc<T>, settings: OrchestratorSettings) -> Self {
        Self {
            transport,
            settings,
            state: Mutex::new(PhaseState::Idle),
            session_abort: Mutex::new(None),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            callback: None,
        }
    }

    /// Attaches a progress callback for live throughput and samples.
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

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn state(&self) -> PhaseState {
        *self.state.lock()
    }

    /// Number of transfer tasks currently alive.
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Aborts the running phase.
    ///
    /// Returns `false` if no phase is running. Calling it repeatedly is
    /// harmless.
    pub fn cancel(&self) -> bool {
        if self.state() == PhaseState::Idle {
            return false;
        }
        match self.session_abort.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs one measurement phase.
    ///
    /// # Errors
    ///
    /// * `Error::Cancelled` if `cancel` fires or [`cancel`](Self::cancel) is
    ///   called before every task has finished
    /// * `Error::NoData` if no bytes were transferred at all
    /// * `Error::Config` for a zero thread count or a phase already running
    pub async fn run_phase(
        &self,
        direction: TransferDirection,
        thread_count: usize,
        durations: PhaseDurations,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult> {
        if thread_count == 0 {
            return Err(Error::Config("At least one transfer task is required".to_string()));
        }
        let abort = self.begin_session(cancel)?;
        let stop = abort.child_token();
        let _idle = IdleOnExit {
            state: &self.state,
            session_abort: &self.session_abort,
        };

        let payload = match direction {
            TransferDirection::Upload => Some(build_upload_payload(self.settings.upload_size_bytes)),
            TransferDirection::Download => None,
        };

        let started = Instant::now();
        let deadline = started + durations.max + self.settings.grace;
        let mut session = TransferSession::new(direction, thread_count, started);

        let handles: Vec<JoinHandle<ThreadResult>> = session
            .counters
            .iter()
            .enumerate()
            .map(|(thread_id, counter)| {
                let task = TaskContext {
                    thread_id,
                    direction,
                    transport: Arc::clone(&self.transport),
                    payload: payload.clone(),
                    counter: counter.clone(),
                    stop: stop.clone(),
                    abort: abort.clone(),
                    started,
                    deadline,
                };
                let active = ActiveTask::enter(&self.active_tasks);
                tokio::spawn(async move {
                    let _active = active;
                    task.run().await
                })
            })
            .collect();

        *self.state.lock() = PhaseState::Running;
        info!(
            "{} phase started with {} tasks (min {:?}, max {:?})",
            direction, thread_count, durations.min, durations.max
        );
        self.notify(ProgressEvent::PhaseStarted {
            direction,
            threads: thread_count,
        });

        self.monitor(&mut session, &handles, durations, &abort).await;

        let reason = session.stop_reason();
        *self.state.lock() = PhaseState::Stopped(reason);
        if reason == StopReason::Cancelled {
            abort.cancel();
        } else {
            stop.cancel();
        }

        let mut threads = Vec::with_capacity(thread_count);
        for (thread_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(result) => threads.push(result),
                Err(e) => {
                    error!("Transfer task {} failed: {}", thread_id, e);
                    threads.push(ThreadResult {
                        thread_id,
                        bytes: session.counters[thread_id].get(),
                        completed_after: started.elapsed(),
                        requests: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if reason == StopReason::Cancelled || abort.is_cancelled() {
            info!("{} phase cancelled", direction);
            return Err(Error::Cancelled);
        }

        let bytes_transferred: u64 = threads.iter().map(|t| t.bytes).sum();
        if bytes_transferred == 0 {
            return Err(Error::NoData(direction));
        }

        let duration = threads
            .iter()
            .map(|t| t.completed_after)
            .max()
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| started.elapsed());
        let speed_mbps = mbps(bytes_transferred, duration);
        let rates = session.rates();

        info!(
            "{} completed: {:.2} Mbps ({} bytes in {:.2}s, {:?})",
            direction,
            speed_mbps,
            bytes_transferred,
            duration.as_secs_f64(),
            reason
        );
        self.notify(ProgressEvent::PhaseCompleted {
            direction,
            stop_reason: reason,
            bytes: bytes_transferred,
            duration,
            mbps: speed_mbps,
        });

        Ok(PhaseResult {
            direction,
            thread_count,
            stop_reason: reason,
            bytes_transferred,
            duration,
            speed_mbps,
            stability: stability_score(&rates),
            samples: session.samples,
            threads,
        })
    }

    /// Moves from `Idle` to `Preparing` and installs the session abort token
    /// under the same lock, so `cancel` never sees a busy state without a
    /// token.
    fn begin_session(&self, cancel: &CancellationToken) -> Result<CancellationToken> {
        let mut state = self.state.lock();
        if *state != PhaseState::Idle {
            return Err(Error::Config("A phase is already running".to_string()));
        }
        let abort = cancel.child_token();
        *self.session_abort.lock() = Some(abort.clone());
        *state = PhaseState::Preparing;
        Ok(abort)
    }

    /// Ticks until the session leaves `Running`.
    async fn monitor(
        &self,
        session: &mut TransferSession,
        handles: &[JoinHandle<ThreadResult>],
        durations: PhaseDurations,
        abort: &CancellationToken,
    ) {
        let direction = session.direction();
        let started = session.started_at();
        let detector = StabilityDetector::new(self.settings.stability);
        let tick = self.settings.update_interval.max(Duration::from_millis(1));

        let mut ticker = time::interval_at(started + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sample_at = started;
        let mut last_bytes = 0u64;

        while session.stop_reason() == StopReason::Running {
            tokio::select! {
                _ = abort.cancelled() => {
                    session.stop(StopReason::Cancelled);
                    break;
                }
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(started);
            let total = session.total_bytes();

            self.notify(ProgressEvent::LiveThroughput {
                direction,
                elapsed,
                bytes: total,
                mbps: session.live_mbps(now),
            });

            let interval = now.saturating_duration_since(last_sample_at);
            if interval >= self.settings.sample_interval {
                let gained = total.saturating_sub(last_bytes);
                if session.record_interval(gained, interval, now) {
                    if let Some(sample) = session.samples().last() {
                        self.notify(ProgressEvent::SpeedSample {
                            direction,
                            sample: *sample,
                        });
                    }

                    if elapsed >= durations.min && detector.is_stable(&session.rates()) {
                        info!("{} speed stabilized, stopping early", direction);
                        session.stop(StopReason::Stabilized);
                        continue;
                    }
                } else {
                    debug!("{}: no progress in last {:?}", direction, interval);
                }
                last_sample_at = now;
                last_bytes = total;
            }

            if elapsed >= durations.max {
                info!("{} max duration reached", direction);
                session.stop(StopReason::MaxDurationReached);
            } else if handles.iter().all(|h| h.is_finished()) {
                warn!("{}: all transfer tasks ended before the phase finished", direction);
                session.stop(StopReason::Error);
            }
        }
    }
}

/// Everything a transfer task needs, moved into the task.
struct TaskContext<T: Transport> {
    thread_id: usize,
    direction: TransferDirection,
    transport: Arc<T>,
    payload: Option<Bytes>,
    counter: ByteCounter,
    stop: CancellationToken,
    abort: CancellationToken,
    started: Instant,
    deadline: Instant,
}

impl<T: Transport> TaskContext<T> {
    /// Issues requests until stopped, failed or past the deadline. Always
    /// yields a result carrying whatever bytes were counted.
    async fn run(self) -> ThreadResult {
        let mut requests = 0u32;

        let work = async {
            while !self.stop.is_cancelled() {
                requests += 1;
                match (&self.payload, self.direction) {
                    (Some(payload), TransferDirection::Upload) => {
                        self.transport
                            .upload(payload.clone(), &self.counter, &self.abort)
                            .await?;
                    }
                    _ => {
                        self.transport.download(&self.counter, &self.stop).await?;
                    }
                }
            }
            Ok::<(), Error>(())
        };

        let error = match time::timeout_at(self.deadline, work).await {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => None,
            Ok(Err(e)) => {
                warn!(
                    "{} task {} failed after {} bytes: {}",
                    self.direction,
                    self.thread_id,
                    self.counter.get(),
                    e
                );
                Some(e.to_string())
            }
            Err(_) => {
                warn!(
                    "{} task {} exceeded its deadline, aborting",
                    self.direction, self.thread_id
                );
                Some("deadline exceeded".to_string())
            }
        };

        ThreadResult {
            thread_id: self.thread_id,
            bytes: self.counter.get(),
            completed_after: self.started.elapsed(),
            requests,
            error,
        }
    }
}

/// Builds an upload body of `size` bytes by repeating one random block.
pub fn build_upload_payload(size: usize) -> Bytes {
    let mut block = vec![0u8; UPLOAD_BLOCK_BYTES.min(size.max(1))];
    StdRng::from_entropy().fill_bytes(&mut block);

    let mut buf = BytesMut::with_capacity(size);
    while buf.len() < size {
        let n = block.len().min(size - buf.len());
        buf.extend_from_slice(&block[..n]);
    }
    buf.freeze()
}
