//! Block-averaging decimation.
//!
//! Used when the acquisition hardware cannot average on the device. Every
//! `compress_ratio` consecutive raw samples of a channel become one output
//! sample. A partial block is carried across reads so batch boundaries do
//! not shift the averaging windows.

use std::collections::BTreeMap;

use crate::hardware::{ChannelId, ChannelSeries};

/// Running block average for one channel.
#[derive(Debug, Clone)]
pub struct BlockAverager {
    ratio: usize,
    sum: f64,
    count: usize,
}

impl BlockAverager {
    /// Averager over blocks of `ratio` samples (`0` is treated as `1`).
    pub fn new(ratio: u32) -> Self {
        Self {
            ratio: (ratio as usize).max(1),
            sum: 0.0,
            count: 0,
        }
    }

    /// Feed one raw sample; yields the block mean when a block completes.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        self.sum += value;
        self.count += 1;
        if self.count == self.ratio {
            let mean = self.sum / self.ratio as f64;
            self.sum = 0.0;
            self.count = 0;
            Some(mean)
        } else {
            None
        }
    }

    /// Raw samples waiting for their block to complete.
    pub fn pending(&self) -> usize {
        self.count
    }
}

/// Block averagers for every channel of a collection.
#[derive(Debug, Clone)]
pub struct ChannelDecimator {
    averagers: BTreeMap<ChannelId, BlockAverager>,
}

impl ChannelDecimator {
    /// One averager per channel.
    pub fn new(channels: &[ChannelId], ratio: u32) -> Self {
        Self {
            averagers: channels
                .iter()
                .map(|ch| (ch.clone(), BlockAverager::new(ratio)))
                .collect(),
        }
    }

    /// Decimate one raw read. Channels not configured here are ignored.
    pub fn feed(&mut self, raw: &ChannelSeries) -> ChannelSeries {
        let mut out = ChannelSeries::new();
        for (channel, averager) in &mut self.averagers {
            let decimated = raw
                .get(channel)
                .map(|values| values.iter().filter_map(|v| averager.push(*v)).collect())
                .unwrap_or_default();
            out.insert(channel.clone(), decimated);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_average() {
        let mut avg = BlockAverager::new(3);
        assert_eq!(avg.push(1.0), None);
        assert_eq!(avg.push(2.0), None);
        assert_eq!(avg.push(3.0), Some(2.0));
        assert_eq!(avg.pending(), 0);
        assert_eq!(avg.push(9.0), None);
        assert_eq!(avg.pending(), 1);
    }

    #[test]
    fn test_partial_block_carries_across_reads() {
        let ch = ChannelId::from("ai0");
        let mut decimator = ChannelDecimator::new(std::slice::from_ref(&ch), 4);

        let mut first = ChannelSeries::new();
        first.insert(ch.clone(), vec![1.0, 1.0, 1.0, 1.0, 5.0, 5.0]);
        assert_eq!(decimator.feed(&first)[&ch], vec![1.0]);

        let mut second = ChannelSeries::new();
        second.insert(ch.clone(), vec![5.0, 5.0, 2.0]);
        assert_eq!(decimator.feed(&second)[&ch], vec![5.0]);
    }

    #[test]
    fn test_ratio_one_is_passthrough() {
        let ch = ChannelId::from("ai1");
        let mut decimator = ChannelDecimator::new(std::slice::from_ref(&ch), 1);
        let mut raw = ChannelSeries::new();
        raw.insert(ch.clone(), vec![0.1, 0.2, 0.3]);
        assert_eq!(decimator.feed(&raw)[&ch], vec![0.1, 0.2, 0.3]);
    }
}
