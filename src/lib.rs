//! # Power Harness
//!
//! Hardware-in-the-loop power-consumption testing for a mobile device. The
//! crate drives a programmable supply, a multi-channel DAQ and a device-control
//! channel through scripted scenarios while sampling rail currents during a
//! synchronized measurement window.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: capability traits for the supply, the device channel and
//!   the DAQ, plus simulated implementations and the verified-retry helper.
//! - **`acquisition`**: the sampling pipeline, block-averaging decimation and
//!   the start/stop coordinator shared with the sequencer.
//! - **`scenario`**: step and scenario definitions and the scenario registry.
//! - **`experiment`**: the run engine (step sequencer), repeat controller,
//!   run state and progress events.
//! - **`results`**: the result-sink contract with CSV and in-memory sinks.
//! - **`config`**: layered configuration (defaults, TOML, environment).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `HarnessError` taxonomy.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod results;
pub mod scenario;

pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult};
pub use experiment::{HarnessContext, RepeatController, RunEngine, RunOptions, RunStatus};
pub use scenario::ScenarioRegistry;
