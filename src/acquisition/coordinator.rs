//! Start/Stop coordination between the sequencer and the sampling worker.
//!
//! One [`StartStopCoordinator`] exists per run. It carries:
//!
//! - the "measurement body started" event and its timestamp, which defines
//!   sample index 0 for the sampling worker,
//! - the cooperative [`StopFlag`], checked by every wait in both workers,
//! - the deadline the sampling worker may wait for the start event.
//!
//! All waits are sliced (at most [`MAX_WAIT_SLICE`]) so a stop request is
//! observed within one slice no matter how long the nominal wait is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::MAX_WAIT_SLICE;
use crate::error::{HarnessError, HarnessResult};

/// Cooperative cancellation flag shared by every worker of a run.
///
/// Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
}

impl StopFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new top-level run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Fail with `CancellationRequested` if a stop was requested.
    pub fn check(&self) -> HarnessResult<()> {
        if self.is_requested() {
            Err(HarnessError::CancellationRequested)
        } else {
            Ok(())
        }
    }
}

/// Sleep for `duration` in slices, returning early on stop.
///
/// # Errors
/// `CancellationRequested` if the flag is set before or during the wait.
pub async fn sleep_cancellable(stop: &StopFlag, duration: Duration, slice: Duration) -> HarnessResult<()> {
    let slice = clamp_slice(slice);
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        stop.check()?;
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep(slice.min(deadline - now)).await;
    }
}

fn clamp_slice(slice: Duration) -> Duration {
    if slice.is_zero() {
        MAX_WAIT_SLICE
    } else {
        slice.min(MAX_WAIT_SLICE)
    }
}

/// Shared start event, stop flag and start deadline for one run.
#[derive(Debug)]
pub struct StartStopCoordinator {
    started_at: Mutex<Option<Instant>>,
    started: Condvar,
    stop: StopFlag,
    start_deadline: Duration,
    slice: Duration,
}

impl StartStopCoordinator {
    /// Create a coordinator sharing `stop` with the rest of the run.
    pub fn new(stop: StopFlag, start_deadline: Duration, slice: Duration) -> Self {
        Self {
            started_at: Mutex::new(None),
            started: Condvar::new(),
            stop,
            start_deadline,
            slice: clamp_slice(slice),
        }
    }

    /// Mark the measurement body as started and wake the sampling worker.
    ///
    /// Returns `false` if the start was already signalled; the original
    /// timestamp is kept.
    pub fn signal_start(&self) -> bool {
        let mut started_at = self.started_at.lock();
        if started_at.is_some() {
            warn!("Start already signalled; ignoring repeated signal");
            return false;
        }
        *started_at = Some(Instant::now());
        self.started.notify_all();
        debug!("Measurement start signalled");
        true
    }

    /// Timestamp of the start signal, if any.
    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    /// Block until the start signal arrives or `timeout` elapses.
    ///
    /// # Errors
    /// - `SynchronizationTimeout` if no signal arrived in time
    /// - `CancellationRequested` if a stop was requested while waiting
    pub fn wait_for_start(&self, timeout: Duration) -> HarnessResult<Instant> {
        self.wait_for_start_or(timeout, || false)
    }

    /// Like [`wait_for_start`](Self::wait_for_start), but also gives up with
    /// `CancellationRequested` as soon as `abort` returns true.
    pub fn wait_for_start_or(
        &self,
        timeout: Duration,
        abort: impl Fn() -> bool,
    ) -> HarnessResult<Instant> {
        let deadline = Instant::now() + timeout;
        let mut started_at = self.started_at.lock();
        loop {
            if let Some(at) = *started_at {
                return Ok(at);
            }
            if self.stop.is_requested() || abort() {
                return Err(HarnessError::CancellationRequested);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::SynchronizationTimeout { deadline: timeout });
            }
            let _ = self
                .started
                .wait_for(&mut started_at, self.slice.min(deadline - now));
        }
    }

    /// Request a cooperative stop of the whole run.
    pub fn request_stop(&self) {
        self.stop.request();
        self.started.notify_all();
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    /// Sliced async sleep honouring the run's stop flag.
    pub async fn sleep(&self, duration: Duration) -> HarnessResult<()> {
        sleep_cancellable(&self.stop, duration, self.slice).await
    }

    /// The shared stop flag.
    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    /// How long the sampling worker waits for the start signal.
    pub fn start_deadline(&self) -> Duration {
        self.start_deadline
    }

    /// Slice length used by every wait.
    pub fn slice(&self) -> Duration {
        self.slice
    }
}
