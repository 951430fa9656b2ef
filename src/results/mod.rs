//! Result hand-off.
//!
//! The engine produces one [`ResultSet`] per measured iteration and gives it
//! to a [`ResultSink`]. Values arrive in physical units (amps); conversion to
//! the display unit happens here, once, when rows are rendered.
//!
//! Column 0 is always `elapsed_index`; each enabled channel follows as
//! `<label> (<unit>)`.

#[cfg(feature = "storage_csv")]
pub mod csv_sink;
pub mod memory;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::acquisition::Sample;
use crate::error::HarnessResult;
use crate::experiment::StepRecord;
use crate::hardware::ChannelId;

#[cfg(feature = "storage_csv")]
pub use csv_sink::CsvResultSink;
pub use memory::MemoryResultSink;

/// Unit used for exported current columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayUnit {
    /// Amps
    #[serde(rename = "A")]
    Amps,
    /// Milliamps
    #[default]
    #[serde(rename = "mA")]
    Milliamps,
    /// Microamps
    #[serde(rename = "uA")]
    Microamps,
}

impl DisplayUnit {
    /// Multiplier from amps.
    pub fn scale(&self) -> f64 {
        match self {
            DisplayUnit::Amps => 1.0,
            DisplayUnit::Milliamps => 1e3,
            DisplayUnit::Microamps => 1e6,
        }
    }

    /// Column suffix.
    pub fn suffix(&self) -> &'static str {
        match self {
            DisplayUnit::Amps => "A",
            DisplayUnit::Milliamps => "mA",
            DisplayUnit::Microamps => "uA",
        }
    }
}

impl fmt::Display for DisplayUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Data of one measured iteration.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Run identifier
    pub run_id: String,
    /// Registry key of the scenario
    pub scenario_key: String,
    /// Human-readable scenario name
    pub scenario_name: String,
    /// 1-based iteration number
    pub iteration_index: u32,
    /// Iterations in the sequence
    pub iteration_count: u32,
    /// Column label per enabled channel
    pub channel_labels: Vec<(ChannelId, String)>,
    /// Unit for rendered values
    pub unit: DisplayUnit,
    /// Sample rate of `samples` in Hz
    pub output_rate: f64,
    /// Samples in physical units, in index order
    pub samples: Vec<Sample>,
    /// Step completion log of the iteration
    pub steps: Vec<StepRecord>,
    /// When the run started
    pub started_at: DateTime<Local>,
}

impl ResultSet {
    /// Name the sink should persist under; iterations never overwrite each other.
    pub fn qualified_name(&self) -> String {
        if self.iteration_count > 1 {
            format!("{}_iter{:02}", self.scenario_key, self.iteration_index)
        } else {
            self.scenario_key.clone()
        }
    }

    /// Column headers.
    pub fn header(&self) -> Vec<String> {
        std::iter::once("elapsed_index".to_string())
            .chain(
                self.channel_labels
                    .iter()
                    .map(|(_, label)| format!("{} ({})", label, self.unit)),
            )
            .collect()
    }

    /// Rows in display units, one value per labelled channel.
    ///
    /// Channels missing from a sample render as NaN.
    pub fn rows(&self) -> impl Iterator<Item = (usize, Vec<f64>)> + '_ {
        let scale = self.unit.scale();
        self.samples.iter().map(move |sample| {
            let values = self
                .channel_labels
                .iter()
                .map(|(ch, _)| sample.values.get(ch).map_or(f64::NAN, |v| v * scale))
                .collect();
            (sample.elapsed_index, values)
        })
    }

    /// Mean of one channel in display units.
    pub fn channel_mean(&self, channel: &ChannelId) -> Option<f64> {
        let values: Vec<f64> = self
            .samples
            .iter()
            .filter_map(|s| s.values.get(channel))
            .map(|v| v * self.unit.scale())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Where an export landed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportReceipt {
    /// Qualified result name
    pub name: String,
    /// File written, for file-based sinks
    pub location: Option<PathBuf>,
    /// Data rows written
    pub rows: usize,
}

/// Persistence for finished result sets.
///
/// Implementations choose the format. Calls are blocking and are made from a
/// blocking-safe context.
pub trait ResultSink: Send + Sync {
    /// Persist one result set.
    fn export(&self, result: &ResultSet) -> HarnessResult<ExportReceipt>;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::collections::BTreeMap;

    pub(crate) fn result_set(iteration_index: u32, iteration_count: u32) -> ResultSet {
        let ai0 = ChannelId::from("ai0");
        let ai1 = ChannelId::from("ai1");
        let labels = vec![
            (ai0.clone(), "VBAT".to_string()),
            (ai1.clone(), "VDD_MAIN".to_string()),
        ];

        let samples = (0..3)
            .map(|i| {
                let mut values = BTreeMap::new();
                values.insert(ai0.clone(), 0.1 * (i + 1) as f64);
                values.insert(ai1.clone(), 0.01);
                Sample {
                    elapsed_index: i,
                    values,
                }
            })
            .collect();

        ResultSet {
            run_id: "run-1".to_string(),
            scenario_key: "screen_onoff".to_string(),
            scenario_name: "Screen On/Off".to_string(),
            iteration_index,
            iteration_count,
            channel_labels: labels,
            unit: DisplayUnit::Milliamps,
            output_rate: 1000.0,
            samples,
            steps: Vec::new(),
            started_at: Local::now(),
        }
    }
}
