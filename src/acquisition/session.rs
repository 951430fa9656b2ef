//! Collection requests, samples and the session that owns them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::config::AcquisitionConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::hardware::ChannelId;

/// Parameters of one timed collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRequest {
    /// Channels to sample, in column order
    pub channels: Vec<ChannelId>,
    /// Hardware sample rate in Hz
    pub raw_rate: f64,
    /// Raw samples averaged into one output sample
    pub compress_ratio: u32,
    /// Wall-clock length of the collection
    pub duration: Duration,
}

impl CollectionRequest {
    /// Build a request for the enabled channels of `config`.
    pub fn from_config(config: &AcquisitionConfig, duration: Duration) -> Self {
        Self {
            channels: config.enabled_channels(),
            raw_rate: config.raw_rate,
            compress_ratio: config.compress_ratio,
            duration,
        }
    }

    /// Decimated rate in Hz.
    pub fn output_rate(&self) -> f64 {
        self.raw_rate / f64::from(self.compress_ratio.max(1))
    }

    /// `duration * output_rate`, rounded to whole samples.
    pub fn expected_sample_count(&self) -> usize {
        (self.duration.as_secs_f64() * self.output_rate()).round() as usize
    }

    /// Reject requests the pipeline cannot honour.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.channels.is_empty() {
            return Err(HarnessError::Configuration(
                "collection requires at least one channel".to_string(),
            ));
        }
        if !(self.raw_rate.is_finite() && self.raw_rate > 0.0) {
            return Err(HarnessError::Configuration(format!(
                "invalid raw rate {}",
                self.raw_rate
            )));
        }
        if self.compress_ratio == 0 {
            return Err(HarnessError::Configuration(
                "compress ratio must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One decimated sample across all channels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Position in the decimated series; logical timestamp in output periods
    pub elapsed_index: usize,
    /// Value per channel in physical units
    pub values: BTreeMap<ChannelId, f64>,
}

/// Samples of one collection, owned by the sampling worker until handed off.
#[derive(Debug, Clone)]
pub struct CollectionSession {
    channels: Vec<ChannelId>,
    raw_rate: f64,
    compress_ratio: u32,
    output_rate: f64,
    expected_sample_count: usize,
    samples: Vec<Sample>,
}

impl CollectionSession {
    /// Empty session sized for `request`.
    pub fn new(request: &CollectionRequest) -> Self {
        let expected = request.expected_sample_count();
        Self {
            channels: request.channels.clone(),
            raw_rate: request.raw_rate,
            compress_ratio: request.compress_ratio,
            output_rate: request.output_rate(),
            expected_sample_count: expected,
            samples: Vec::with_capacity(expected),
        }
    }

    /// Append the next sample.
    ///
    /// The index is assigned in arrival order. Returns `false` and drops the
    /// values once the expected count is reached.
    pub fn push(&mut self, values: BTreeMap<ChannelId, f64>) -> bool {
        let index = self.samples.len();
        if index >= self.expected_sample_count {
            return false;
        }
        self.samples.push(Sample {
            elapsed_index: index,
            values,
        });
        true
    }

    /// Sampled channels.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Hardware rate in Hz.
    pub fn raw_rate(&self) -> f64 {
        self.raw_rate
    }

    /// Decimation factor.
    pub fn compress_ratio(&self) -> u32 {
        self.compress_ratio
    }

    /// Output rate in Hz.
    pub fn output_rate(&self) -> f64 {
        self.output_rate
    }

    /// Wall-clock spacing between consecutive samples.
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.output_rate)
    }

    /// Samples a full collection holds.
    pub fn expected_sample_count(&self) -> usize {
        self.expected_sample_count
    }

    /// Samples still missing.
    pub fn remaining(&self) -> usize {
        self.expected_sample_count - self.samples.len()
    }

    /// Samples collected so far.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True once every expected sample is present.
    pub fn is_complete(&self) -> bool {
        self.samples.len() == self.expected_sample_count
    }

    /// Samples in index order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Consume the session, keeping the samples.
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Series of one channel, in index order.
    pub fn channel_values(&self, channel: &ChannelId) -> Vec<f64> {
        self.samples
            .iter()
            .filter_map(|s| s.values.get(channel).copied())
            .collect()
    }

    /// Mean of one channel, if it has samples.
    pub fn mean(&self, channel: &ChannelId) -> Option<f64> {
        let values = self.channel_values(channel);
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(duration_ms: u64) -> CollectionRequest {
        CollectionRequest {
            channels: vec![ChannelId::from("ai0")],
            raw_rate: 30_000.0,
            compress_ratio: 30,
            duration: Duration::from_millis(duration_ms),
        }
    }

    #[test]
    fn test_expected_sample_count() {
        assert_eq!(request(10_000).expected_sample_count(), 10_000);
        assert_eq!(request(2_500).expected_sample_count(), 2_500);
        assert_eq!(request(10_000).output_rate(), 1000.0);
    }

    #[test]
    fn test_push_assigns_indices_and_caps() {
        let mut session = CollectionSession::new(&request(3));
        for i in 0..5 {
            let mut values = BTreeMap::new();
            values.insert(ChannelId::from("ai0"), i as f64);
            let accepted = session.push(values);
            assert_eq!(accepted, i < 3);
        }

        assert!(session.is_complete());
        let indices: Vec<usize> = session.samples().iter().map(|s| s.elapsed_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(session.mean(&ChannelId::from("ai0")), Some(1.0));
    }

    #[test]
    fn test_validate_rejects_empty_channels() {
        let mut req = request(1000);
        req.channels.clear();
        assert!(req.validate().is_err());

        let mut req = request(1000);
        req.compress_ratio = 0;
        assert!(req.validate().is_err());
    }
}
