//! Harness configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/harness.toml` (base configuration)
//! 2. Environment variables (prefixed with `POWER_HARNESS_`, `__` separates sections)
//!
//! Every section has serde defaults, so an empty or missing file yields a
//! usable bench configuration.
//!
//! # Example
//! ```no_run
//! use power_harness::config::HarnessConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarnessConfig::load()?;
//! config.validate()?;
//! println!("Output rate: {} Hz", config.acquisition.output_rate());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};
use crate::hardware::{ChannelId, MockMode, WifiBand, WifiNetwork};
use crate::results::DisplayUnit;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/harness.toml";

/// Upper bound for any sliced wait; stop latency depends on it.
pub const MAX_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition rates and channel map
    pub acquisition: AcquisitionConfig,
    /// Deadlines, slices and pauses
    pub timing: TimingConfig,
    /// Bounded retries for device-setting steps
    pub retry: RetryConfig,
    /// Result export settings
    pub results: ResultsConfig,
    /// Wi-Fi credentials, keyed by the name steps refer to
    pub networks: BTreeMap<String, WifiNetwork>,
    /// Simulated bench settings
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Acquisition hardware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Hardware sample rate in Hz
    pub raw_rate: f64,
    /// Block-averaging factor between raw and output rate
    pub compress_ratio: u32,
    /// Length of one blocking read; bounds stop latency in the worker
    #[serde(with = "humantime_serde")]
    pub batch: Duration,
    /// Channel map
    pub channels: Vec<ChannelConfig>,
}

/// One acquisition channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware channel identifier (e.g. "ai0")
    pub id: ChannelId,
    /// Rail name used for result columns
    pub label: String,
    /// Whether this channel is sampled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long the sampling worker waits for the measurement body to start
    #[serde(with = "humantime_serde")]
    pub start_deadline: Duration,
    /// Slice length for every cancellable wait
    #[serde(with = "humantime_serde")]
    pub wait_slice: Duration,
    /// Bound on joining the sampling worker at stop
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
    /// Pause between repeat iterations
    #[serde(with = "humantime_serde")]
    pub inter_iteration_pause: Duration,
    /// Stabilization wait used by the quick reset step
    #[serde(with = "humantime_serde")]
    pub quick_reset_stabilization: Duration,
    /// Added to a step's nominal duration to form its time budget
    #[serde(with = "humantime_serde")]
    pub step_timeout_margin: Duration,
}

/// Retry configuration for device-setting steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per command, including the first
    pub attempts: u32,
    /// Pause between attempts
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

/// Result export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Output directory for CSV files
    pub output_dir: PathBuf,
    /// Unit used for exported channel columns
    pub unit: DisplayUnit,
}

/// Simulated bench configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Timing behaviour of simulated devices
    pub mode: MockMode,
    /// Baseline current drawn on each simulated rail, in amps
    pub baseline_current: f64,
}

// Default value functions
fn default_enabled() -> bool {
    true
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "2g_primary".to_string(),
            WifiNetwork {
                ssid: "bench_2g".to_string(),
                password: String::new(),
                band: WifiBand::Ghz2_4,
            },
        );
        networks.insert(
            "5g_primary".to_string(),
            WifiNetwork {
                ssid: "bench_5g".to_string(),
                password: String::new(),
                band: WifiBand::Ghz5,
            },
        );

        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            results: ResultsConfig::default(),
            networks,
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Power Harness".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let channel = |id: &str, label: &str, enabled: bool| ChannelConfig {
            id: ChannelId::from(id),
            label: label.to_string(),
            enabled,
        };

        Self {
            raw_rate: 30_000.0,
            compress_ratio: 30,
            batch: Duration::from_millis(500),
            channels: vec![
                channel("ai0", "VBAT", true),
                channel("ai1", "VDD_MAIN", true),
                channel("ai2", "VDD_DISPLAY", false),
                channel("ai3", "VDD_MODEM", false),
            ],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            start_deadline: Duration::from_secs(25),
            wait_slice: MAX_WAIT_SLICE,
            join_timeout: Duration::from_secs(3),
            inter_iteration_pause: Duration::from_secs(5),
            quick_reset_stabilization: Duration::from_secs(10),
            step_timeout_margin: Duration::from_secs(30),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("test_results"),
            unit: DisplayUnit::Milliamps,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: MockMode::Realistic,
            baseline_current: 0.180,
        }
    }
}

impl AcquisitionConfig {
    /// Decimated output rate in Hz.
    pub fn output_rate(&self) -> f64 {
        self.raw_rate / f64::from(self.compress_ratio.max(1))
    }

    /// Channels that are sampled, in configuration order.
    pub fn enabled_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|ch| ch.enabled)
            .map(|ch| ch.id.clone())
            .collect()
    }

    /// Column labels for the enabled channels, in configuration order.
    pub fn channel_labels(&self) -> Vec<(ChannelId, String)> {
        self.channels
            .iter()
            .filter(|ch| ch.enabled)
            .map(|ch| (ch.id.clone(), ch.label.clone()))
            .collect()
    }
}

impl HarnessConfig {
    /// Load configuration from `config/harness.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `POWER_HARNESS_`.
    /// Example: `POWER_HARNESS_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> HarnessResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> HarnessResult<Self> {
        let config = Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("POWER_HARNESS_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> HarnessResult<()> {
        self.check().map_err(HarnessError::Configuration)
    }

    fn check(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let acq = &self.acquisition;
        if !(acq.raw_rate.is_finite() && acq.raw_rate > 0.0) {
            return Err(format!("Invalid raw_rate {}. Must be > 0", acq.raw_rate));
        }
        if acq.compress_ratio == 0 {
            return Err("Invalid compress_ratio 0. Must be >= 1".to_string());
        }
        if acq.batch.is_zero() || acq.batch > Duration::from_secs(1) {
            return Err(format!(
                "Invalid acquisition batch {:?}. Must be within (0, 1s]",
                acq.batch
            ));
        }

        // Validate channel IDs are unique
        let mut ids = HashSet::new();
        for channel in &acq.channels {
            if !ids.insert(&channel.id) {
                return Err(format!("Duplicate channel ID: {}", channel.id));
            }
        }
        if acq.enabled_channels().is_empty() {
            return Err("At least one acquisition channel must be enabled".to_string());
        }

        if self.timing.wait_slice.is_zero() || self.timing.wait_slice > MAX_WAIT_SLICE {
            return Err(format!(
                "Invalid wait_slice {:?}. Must be within (0, {:?}]",
                self.timing.wait_slice, MAX_WAIT_SLICE
            ));
        }
        if self.timing.start_deadline.is_zero() {
            return Err("start_deadline must be greater than zero".to_string());
        }
        if self.retry.attempts == 0 {
            return Err("retry.attempts must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.output_rate(), 1000.0);
        assert_eq!(config.timing.start_deadline, Duration::from_secs(25));
        assert_eq!(
            config.acquisition.enabled_channels(),
            vec![ChannelId::from("ai0"), ChannelId::from("ai1")]
        );
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = HarnessConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(HarnessError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_channel_ids() {
        let mut config = HarnessConfig::default();
        config.acquisition.channels.push(ChannelConfig {
            id: ChannelId::from("ai0"),
            label: "dup".to_string(),
            enabled: true,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wait_slice_bound() {
        let mut config = HarnessConfig::default();
        config.timing.wait_slice = Duration::from_millis(250);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_enabled_channels() {
        let mut config = HarnessConfig::default();
        for ch in &mut config.acquisition.channels {
            ch.enabled = false;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_labels_keep_configured_order() {
        let mut config = HarnessConfig::default();
        config.acquisition.channels = ["ai2", "ai10", "ai1"]
            .iter()
            .map(|id| ChannelConfig {
                id: ChannelId::from(*id),
                label: id.to_uppercase(),
                enabled: *id != "ai1",
            })
            .collect();

        let labels = config.acquisition.channel_labels();
        assert_eq!(
            labels,
            vec![
                (ChannelId::from("ai2"), "AI2".to_string()),
                (ChannelId::from("ai10"), "AI10".to_string()),
            ]
        );
    }

    #[test]
    fn test_load_from_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "harness.toml",
                r#"
                [application]
                log_level = "debug"

                [acquisition]
                raw_rate = 10000.0
                compress_ratio = 10

                [timing]
                start_deadline = "5s"
                inter_iteration_pause = "250ms"
                "#,
            )?;
            jail.set_env("POWER_HARNESS_RETRY__ATTEMPTS", "5");

            let config = HarnessConfig::load_from("harness.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.acquisition.output_rate(), 1000.0);
            assert_eq!(config.timing.start_deadline, Duration::from_secs(5));
            assert_eq!(config.timing.inter_iteration_pause, Duration::from_millis(250));
            assert_eq!(config.retry.attempts, 5);
            // untouched sections keep their defaults
            assert_eq!(config.timing.wait_slice, MAX_WAIT_SLICE);
            assert!(config.networks.contains_key("2g_primary"));
            Ok(())
        });
    }
}
