//! Hardware ports and simulated implementations.
//!
//! - `capabilities`: the traits the engine consumes
//! - `mock`: simulated supply and handset
//! - `retry`: verified, bounded-retry command helper

pub mod capabilities;
pub mod mock;
pub mod retry;

pub use capabilities::{
    Acquisition, ChannelId, ChannelSeries, DeviceCheck, DeviceControl, PowerControl,
    SettingsReport, WifiBand, WifiNetwork,
};
pub use mock::{FaultPlan, HandsetState, MockMode, SimulatedHandset, SimulatedPowerSupply};
pub use retry::{verified_command, RetryPolicy};
