//! Collaborator Ports
//!
//! The engine never talks to vendor drivers directly. It consumes three
//! small capability traits, and any bench (real drivers, simulators, test
//! doubles) plugs in by implementing them:
//!
//! - [`PowerControl`]: the programmable power supply / monitor
//! - [`DeviceControl`]: shell-style commands against the device under test
//! - [`Acquisition`]: hardware-timed multi-channel sampling
//!
//! # Design Philosophy
//!
//! - `PowerControl` and `DeviceControl` are async (`#[async_trait]`) and
//!   thread-safe (`Send + Sync`); they are driven from the sequencer task.
//! - Device commands return `bool` and never error for expected hardware
//!   flakiness. Verification failures are logged by the caller.
//! - `Acquisition` is synchronous: its reads block for the requested
//!   duration and run on the dedicated sampling thread, never on the runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! struct BenchSupply { volts: Mutex<f64> }
//!
//! #[async_trait]
//! impl PowerControl for BenchSupply {
//!     async fn set_voltage(&self, volts: f64) -> bool {
//!         *self.volts.lock() = volts;
//!         true
//!     }
//!
//!     async fn read_voltage(&self) -> HarnessResult<f64> {
//!         Ok(*self.volts.lock())
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;

/// Identifier of one acquisition channel (e.g. `ai0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-channel sample series returned by one acquisition read.
pub type ChannelSeries = BTreeMap<ChannelId, Vec<f64>>;

/// Wi-Fi band selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiBand {
    /// 2.4 GHz
    #[serde(rename = "2.4ghz", alias = "2g")]
    Ghz2_4,
    /// 5 GHz
    #[serde(rename = "5ghz", alias = "5g")]
    Ghz5,
}

impl fmt::Display for WifiBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WifiBand::Ghz2_4 => write!(f, "2.4GHz"),
            WifiBand::Ghz5 => write!(f, "5GHz"),
        }
    }
}

/// Wi-Fi credentials for a connectivity step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    /// Network name
    pub ssid: String,
    /// Pre-shared key (empty for open networks)
    #[serde(default)]
    pub password: String,
    /// Band to join
    pub band: WifiBand,
}

/// Outcome of applying the default environment settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsReport {
    /// Settings that were applied and verified
    pub applied: usize,
    /// Settings attempted
    pub total: usize,
}

impl SettingsReport {
    /// Fraction of settings applied, 1.0 for an empty batch.
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.applied as f64 / self.total as f64
        }
    }

    /// True when every setting was applied.
    pub fn is_complete(&self) -> bool {
        self.applied >= self.total
    }
}

/// Observable device state used to verify a command took effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCheck {
    /// Display is on
    ScreenOn,
    /// Display is off
    ScreenOff,
    /// Keyguard dismissed
    Unlocked,
    /// Airplane mode enabled
    FlightMode,
    /// Associated with the given SSID
    WifiConnected(String),
    /// Bluetooth radio enabled
    BluetoothOn,
    /// No recent apps left
    RecentsCleared,
    /// Battery slate mode matches
    SlateMode(bool),
}

/// Capability: Power Control
///
/// Programmable supply that powers the device under test.
///
/// # Contract
/// - `set_voltage` returns `false` on rejection or no reply; it never panics
/// - `read_voltage` returns the measured output in volts
/// - Implementations bound their own I/O with a timeout
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Program the output voltage.
    async fn set_voltage(&self, volts: f64) -> bool;

    /// Read back the output voltage.
    ///
    /// # Returns
    /// - Ok(volts) on success
    /// - Err(ConnectionUnavailable | CommandTimeout) when the supply is unreachable
    async fn read_voltage(&self) -> HarnessResult<f64>;

    /// Whether the supply is reachable.
    async fn is_connected(&self) -> bool {
        true
    }
}

/// Capability: Device Control
///
/// Shell-style commands against the device under test. Every operation is
/// idempotent and individually timed by the implementation (5-30 s ceiling).
///
/// # Contract
/// - Operations return `true` when the command was accepted
/// - Expected flakiness is reported as `false`, never as a panic
/// - `check` reports observable state so callers can verify a command
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Whether the control channel reaches the device.
    async fn is_connected(&self) -> bool;

    /// Wake the display.
    async fn turn_screen_on(&self) -> bool;
    /// Put the display to sleep.
    async fn turn_screen_off(&self) -> bool;
    /// Dismiss the keyguard.
    async fn unlock(&self) -> bool;
    /// Press the home key.
    async fn press_home(&self) -> bool;
    /// Press the back key.
    async fn press_back(&self) -> bool;
    /// Remove every entry from the recent-apps list.
    async fn clear_recent_apps(&self) -> bool;
    /// Enable airplane mode.
    async fn enable_flight_mode(&self) -> bool;
    /// Join a Wi-Fi network.
    async fn connect_wifi(&self, network: &WifiNetwork) -> bool;
    /// Turn the Bluetooth radio on.
    async fn enable_bluetooth(&self) -> bool;
    /// Apply the bench's default environment (brightness, timeouts, radios).
    async fn apply_default_settings(&self) -> SettingsReport;
    /// Launch an app by package identifier.
    async fn open_app(&self, identifier: &str) -> bool;
    /// Set the display sleep timeout.
    async fn set_screen_timeout(&self, timeout: Duration) -> bool;

    /// Enable or disable battery slate mode (USB power cut during measurement).
    async fn set_battery_slate_mode(&self, enabled: bool) -> bool {
        let _ = enabled;
        true
    }

    /// Query observable state.
    ///
    /// The default implementation cannot observe anything and trusts the
    /// command result.
    async fn check(&self, check: DeviceCheck) -> bool {
        let _ = check;
        true
    }
}

/// Capability: Hardware-timed Acquisition
///
/// Multi-channel DAQ sampling shunt voltages at a fixed hardware clock.
///
/// # Contract
/// - `read_channels_hardware_timed` blocks for roughly `duration`
/// - Returned series hold `duration * raw_rate / compress_ratio` values per channel
/// - Values are physical units (amps/volts); no scaling happens here
/// - When `supports_block_averaging` is false the caller passes `compress_ratio = 1`
///   and averages locally
pub trait Acquisition: Send + Sync {
    /// Whether the hardware is present and configured.
    fn is_connected(&self) -> bool;

    /// Whether the hardware can block-average on the device.
    fn supports_block_averaging(&self) -> bool {
        false
    }

    /// Read all channels for `duration` at `raw_rate`.
    fn read_channels_hardware_timed(
        &self,
        channels: &[ChannelId],
        raw_rate: f64,
        compress_ratio: u32,
        duration: Duration,
    ) -> HarnessResult<ChannelSeries>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_report_ratio() {
        let report = SettingsReport {
            applied: 7,
            total: 10,
        };
        assert!((report.success_ratio() - 0.7).abs() < f64::EPSILON);
        assert!(!report.is_complete());

        let empty = SettingsReport {
            applied: 0,
            total: 0,
        };
        assert_eq!(empty.success_ratio(), 1.0);
        assert!(empty.is_complete());
    }

    #[test]
    fn test_channel_id_ordering_and_display() {
        let mut ids = vec![ChannelId::from("ai2"), ChannelId::from("ai0")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "ai0");
        assert_eq!(ids[1].to_string(), "ai2");
    }

    #[test]
    fn test_wifi_band_aliases() {
        let net: WifiNetwork =
            serde_json::from_str(r#"{"ssid":"lab","band":"2g"}"#).unwrap();
        assert_eq!(net.band, WifiBand::Ghz2_4);
        assert!(net.password.is_empty());
    }
}
