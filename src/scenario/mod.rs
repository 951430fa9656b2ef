//! Scenario definitions.
//!
//! A scenario is a [`TestConfig`]: default parameters plus an ordered list of
//! [`TestStep`]s. Each step names an [`ActionKind`], a closed set of
//! operations the sequencer knows how to execute. Every kind declares its
//! fault policy, whether its duration is a fixed wait, and whether it belongs
//! to the measurement phase that repeat iterations re-run.

pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

pub use registry::{RegistryBuilder, ScenarioRegistry};

/// Upper bound for a screen toggle step's `interval_s`.
pub const MAX_TOGGLE_INTERVAL_S: f64 = 3600.0;

/// How a step failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log the failure and continue
    BestEffort,
    /// Fail the run
    Critical,
}

/// Scripted body run while sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Screen on at t=0, power key toggles the display every `interval_s`
    ScreenToggle,
    /// Open an app at t=0, press back halfway through
    PhoneApp,
    /// No interaction
    IdleWait,
}

/// Operation executed by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Cut USB charging during the measurement
    EnableSlateMode,
    /// Restore USB charging
    DisableSlateMode,
    /// Apply the bench's default environment
    ApplyDefaultSettings,
    /// Wake and unlock the device
    ScreenOnAndUnlock,
    /// Program the supply to the scenario voltage
    SetVoltage,
    /// Enable airplane mode
    EnableFlightMode,
    /// Join the Wi-Fi network named by the `network` parameter
    ConnectWifi,
    /// Turn Bluetooth on
    EnableBluetooth,
    /// Press home and clear recent apps
    HomeAndClearApps,
    /// Clear recent apps
    ClearRecentApps,
    /// Put the display to sleep
    ScreenOff,
    /// Let current settle for the step duration
    WaitStabilization,
    /// Clear app state, apply the scenario's pre-condition, then settle
    QuickReset,
    /// Start the sampling pipeline
    StartSampling,
    /// Run the scripted measurement body
    RunMeasurement(MeasurementKind),
    /// Stop the sampling pipeline and take its session
    StopSampling,
    /// Hand the collected data to the result sink
    ExportResult,
}

impl ActionKind {
    /// Fault policy for this action.
    pub fn fault_policy(&self) -> FaultPolicy {
        match self {
            ActionKind::EnableSlateMode
            | ActionKind::DisableSlateMode
            | ActionKind::ApplyDefaultSettings
            | ActionKind::ConnectWifi
            | ActionKind::EnableBluetooth
            | ActionKind::QuickReset
            | ActionKind::StartSampling
            | ActionKind::StopSampling => FaultPolicy::BestEffort,
            ActionKind::ScreenOnAndUnlock
            | ActionKind::SetVoltage
            | ActionKind::EnableFlightMode
            | ActionKind::HomeAndClearApps
            | ActionKind::ClearRecentApps
            | ActionKind::ScreenOff
            | ActionKind::WaitStabilization
            | ActionKind::RunMeasurement(_)
            | ActionKind::ExportResult => FaultPolicy::Critical,
        }
    }

    /// Whether the step's duration is slept by the sequencer after the action.
    pub fn is_fixed_wait(&self) -> bool {
        matches!(self, ActionKind::WaitStabilization | ActionKind::QuickReset)
    }

    /// Whether repeat iterations re-run this step.
    pub fn is_measurement_phase(&self) -> bool {
        matches!(
            self,
            ActionKind::StartSampling
                | ActionKind::RunMeasurement(_)
                | ActionKind::StopSampling
                | ActionKind::ExportResult
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::EnableSlateMode => "enable_slate_mode",
            ActionKind::DisableSlateMode => "disable_slate_mode",
            ActionKind::ApplyDefaultSettings => "apply_default_settings",
            ActionKind::ScreenOnAndUnlock => "screen_on_and_unlock",
            ActionKind::SetVoltage => "set_voltage",
            ActionKind::EnableFlightMode => "enable_flight_mode",
            ActionKind::ConnectWifi => "connect_wifi",
            ActionKind::EnableBluetooth => "enable_bluetooth",
            ActionKind::HomeAndClearApps => "home_and_clear_apps",
            ActionKind::ClearRecentApps => "clear_recent_apps",
            ActionKind::ScreenOff => "screen_off",
            ActionKind::WaitStabilization => "wait_stabilization",
            ActionKind::QuickReset => "quick_reset",
            ActionKind::StartSampling => "start_sampling",
            ActionKind::RunMeasurement(MeasurementKind::ScreenToggle) => "measure_screen_toggle",
            ActionKind::RunMeasurement(MeasurementKind::PhoneApp) => "measure_phone_app",
            ActionKind::RunMeasurement(MeasurementKind::IdleWait) => "measure_idle",
            ActionKind::StopSampling => "stop_sampling",
            ActionKind::ExportResult => "export_result",
        };
        f.write_str(name)
    }
}

/// A step parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Float value
    Float(f64),
    /// String value
    String(String),
}

impl ParamValue {
    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(v) => Some(*v),
            ParamValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Get as float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    /// Name reported in progress and results
    pub name: String,
    /// Fixed wait for wait steps, otherwise the nominal time the action takes
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Operation to run
    pub action: ActionKind,
    /// Action-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParamValue>,
}

impl TestStep {
    /// Step with no parameters.
    pub fn new(name: impl Into<String>, duration: Duration, action: ActionKind) -> Self {
        Self {
            name: name.into(),
            duration,
            action,
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// The synthetic reset step that opens iterations 2..N.
    pub fn quick_reset(stabilization: Duration) -> Self {
        Self::new("quick_reset", stabilization, ActionKind::QuickReset)
    }

    /// Float parameter, falling back to `default`.
    pub fn f64_param(&self, key: &str, default: f64) -> f64 {
        self.parameters
            .get(key)
            .and_then(ParamValue::as_f64)
            .unwrap_or(default)
    }

    /// Integer parameter, falling back to `default`.
    pub fn i64_param(&self, key: &str, default: i64) -> i64 {
        self.parameters
            .get(key)
            .and_then(ParamValue::as_i64)
            .unwrap_or(default)
    }

    /// String parameter.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(ParamValue::as_str)
    }
}

/// Device state to establish before re-measuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPrecondition {
    /// Turn the display off
    ScreenOff,
}

/// What the quick reset of iterations 2..N does for a scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuickResetPlan {
    /// Pre-condition applied after clearing apps
    #[serde(default)]
    pub precondition: Option<ResetPrecondition>,
    /// Settle time, overriding the configured default
    #[serde(default, with = "humantime_serde")]
    pub stabilization: Option<Duration>,
}

/// A complete scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Human-readable name
    pub name: String,
    /// What the scenario measures
    pub description: String,
    /// Supply voltage in volts
    pub target_voltage: f64,
    /// Current settle time before measuring
    #[serde(with = "humantime_serde")]
    pub stabilization_time: Duration,
    /// Length of the measurement window
    #[serde(with = "humantime_serde")]
    pub test_duration: Duration,
    /// Ordered steps
    pub steps: Vec<TestStep>,
    /// Reset used by repeat iterations
    #[serde(default)]
    pub quick_reset: QuickResetPlan,
}

impl TestConfig {
    /// Steps re-run by iterations 2..N, in their original order.
    pub fn measurement_steps(&self) -> impl Iterator<Item = &TestStep> {
        self.steps.iter().filter(|s| s.action.is_measurement_phase())
    }

    /// The scripted body, if the scenario measures anything.
    pub fn measurement_kind(&self) -> Option<MeasurementKind> {
        self.steps.iter().find_map(|s| match s.action {
            ActionKind::RunMeasurement(kind) => Some(kind),
            _ => None,
        })
    }

    /// Sum of nominal step durations.
    pub fn nominal_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration).sum()
    }

    /// Check the step list is executable.
    ///
    /// # Errors
    /// `InvalidScenario` naming the first problem found.
    pub fn validate(&self, key: &str) -> HarnessResult<()> {
        let invalid = |reason: String| HarnessError::InvalidScenario {
            key: key.to_string(),
            reason,
        };

        if self.steps.is_empty() {
            return Err(invalid("scenario has no steps".to_string()));
        }
        if !(self.target_voltage.is_finite() && self.target_voltage > 0.0) {
            return Err(invalid(format!("invalid target voltage {}", self.target_voltage)));
        }
        if let Some(step) = self.steps.iter().find(|s| s.name.trim().is_empty()) {
            return Err(invalid(format!("unnamed {} step", step.action)));
        }

        for step in &self.steps {
            if step.action != ActionKind::RunMeasurement(MeasurementKind::ScreenToggle) {
                continue;
            }
            let interval = step.f64_param("interval_s", 3.0);
            if !(interval.is_finite() && interval > 0.0 && interval <= MAX_TOGGLE_INTERVAL_S) {
                return Err(invalid(format!(
                    "step '{}': interval_s {interval} outside (0, {MAX_TOGGLE_INTERVAL_S}]",
                    step.name
                )));
            }
            let presses = step.i64_param("presses", 10);
            if u32::try_from(presses).is_err() {
                return Err(invalid(format!(
                    "step '{}': presses {presses} outside 0..={}",
                    step.name,
                    u32::MAX
                )));
            }
        }

        let position = |pred: &dyn Fn(&ActionKind) -> bool| {
            self.steps.iter().position(|s| pred(&s.action))
        };
        let count = |pred: &dyn Fn(&ActionKind) -> bool| {
            self.steps.iter().filter(|s| pred(&s.action)).count()
        };

        let starts = count(&|a| *a == ActionKind::StartSampling);
        let stops = count(&|a| *a == ActionKind::StopSampling);
        let bodies = count(&|a| matches!(a, ActionKind::RunMeasurement(_)));
        if starts > 1 || stops > 1 || bodies > 1 {
            return Err(invalid(
                "at most one start_sampling, measurement body and stop_sampling per scenario"
                    .to_string(),
            ));
        }
        if starts != stops {
            return Err(invalid("start_sampling and stop_sampling must be paired".to_string()));
        }

        let start = position(&|a| *a == ActionKind::StartSampling);
        let body = position(&|a| matches!(a, ActionKind::RunMeasurement(_)));
        let stop = position(&|a| *a == ActionKind::StopSampling);
        let export = position(&|a| *a == ActionKind::ExportResult);

        if let (Some(start), Some(stop)) = (start, stop) {
            match body {
                Some(body) if start < body && body < stop => {}
                _ => {
                    return Err(invalid(
                        "measurement body must sit between start_sampling and stop_sampling"
                            .to_string(),
                    ))
                }
            }
        }
        if let Some(export) = export {
            if stop.map_or(true, |stop| export < stop) {
                return Err(invalid("export_result must follow stop_sampling".to_string()));
            }
        }

        Ok(())
    }
}
