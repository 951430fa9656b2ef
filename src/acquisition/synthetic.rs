//! Synthetic acquisition source.
//!
//! Produces plausible rail currents with the same shape contract as real
//! hardware: `duration * raw_rate / compress_ratio` values per channel. The
//! sampling pipeline falls back to it when no DAQ is reachable, and the
//! simulated bench uses it as its DAQ.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{HarnessError, HarnessResult, Port};
use crate::hardware::{Acquisition, ChannelId, ChannelSeries};

/// Waveform generator implementing [`Acquisition`].
pub struct SyntheticAcquisition {
    connected: AtomicBool,
    native_averaging: bool,
    paced: bool,
    baseline: f64,
    rng: Mutex<StdRng>,
    reads: AtomicUsize,
    fail_after: Option<usize>,
}

impl SyntheticAcquisition {
    /// Unpaced source: reads return immediately.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            native_averaging: false,
            paced: false,
            baseline: 0.180,
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
            reads: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    /// Block each read for its requested duration, like real hardware.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Advertise on-device block averaging.
    pub fn with_native_averaging(mut self, enabled: bool) -> Self {
        self.native_averaging = enabled;
        self
    }

    /// Mean current of the first channel, in amps.
    pub fn with_baseline(mut self, amps: f64) -> Self {
        self.baseline = amps;
        self
    }

    /// Fail every read after the first `reads` succeeded.
    pub fn failing_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }

    /// Simulate the device being unplugged or returning.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn level(&self, channel_index: usize, phase: f64) -> f64 {
        // each rail draws a smaller share with a slow ripple
        let share = 1.0 / (channel_index as f64 + 1.0);
        self.baseline * share * (1.0 + 0.05 * phase.sin())
    }
}

impl Default for SyntheticAcquisition {
    fn default() -> Self {
        Self::new()
    }
}

impl Acquisition for SyntheticAcquisition {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn supports_block_averaging(&self) -> bool {
        self.native_averaging
    }

    fn read_channels_hardware_timed(
        &self,
        channels: &[ChannelId],
        raw_rate: f64,
        compress_ratio: u32,
        duration: Duration,
    ) -> HarnessResult<ChannelSeries> {
        if !self.is_connected() {
            return Err(HarnessError::unavailable(Port::Acquisition, "synthetic source disconnected"));
        }
        let served = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| served >= limit) {
            return Err(HarnessError::unavailable(Port::Acquisition, "device removed during read"));
        }

        let ratio = f64::from(compress_ratio.max(1));
        let count = (duration.as_secs_f64() * raw_rate / ratio).round() as usize;

        if self.paced {
            thread::sleep(duration);
        }

        let mut rng = self.rng.lock();
        let mut series = ChannelSeries::new();
        for (index, channel) in channels.iter().enumerate() {
            // averaging shrinks the noise the way the hardware would
            let noise = 0.002 / ratio.sqrt();
            let values = (0..count)
                .map(|i| {
                    let phase = (served * count + i) as f64 / 50.0;
                    self.level(index, phase) + rng.gen_range(-noise..=noise)
                })
                .collect();
            series.insert(channel.clone(), values);
        }
        Ok(series)
    }
}
