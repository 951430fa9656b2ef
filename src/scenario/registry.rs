//! Static scenario catalog.
//!
//! The registry is built once (normally at process start) and is read-only
//! afterwards. Lookups of unknown keys return `ScenarioNotFound` so callers
//! can probe availability before starting a run.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::scenario::{
    ActionKind, MeasurementKind, QuickResetPlan, ResetPrecondition, TestConfig, TestStep,
};

/// Key of the screen on/off scenario.
pub const SCREEN_ONOFF: &str = "screen_onoff";
/// Key of the phone app scenario.
pub const PHONE_APP: &str = "phone_app";
/// Key of the idle scenario.
pub const IDLE_WAIT: &str = "idle_wait";

/// Read-only map of scenario key to [`TestConfig`].
#[derive(Debug, Clone)]
pub struct ScenarioRegistry {
    scenarios: BTreeMap<String, TestConfig>,
}

impl ScenarioRegistry {
    /// Registry holding the built-in scenarios.
    pub fn builtin() -> Self {
        let mut scenarios = BTreeMap::new();
        scenarios.insert(SCREEN_ONOFF.to_string(), screen_onoff());
        scenarios.insert(PHONE_APP.to_string(), phone_app());
        scenarios.insert(IDLE_WAIT.to_string(), idle_wait());
        Self { scenarios }
    }

    /// Start building a custom registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a scenario.
    ///
    /// # Errors
    /// `ScenarioNotFound` for unknown keys.
    pub fn get(&self, key: &str) -> HarnessResult<&TestConfig> {
        self.scenarios
            .get(key)
            .ok_or_else(|| HarnessError::ScenarioNotFound(key.to_string()))
    }

    /// Every scenario by key.
    pub fn list(&self) -> &BTreeMap<String, TestConfig> {
        &self.scenarios
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.scenarios.contains_key(key)
    }

    /// Registered keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    /// Number of scenarios.
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl Default for ScenarioRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Builder validating scenarios before they become immutable.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    scenarios: BTreeMap<String, TestConfig>,
}

impl RegistryBuilder {
    /// Include the built-in scenarios.
    pub fn with_builtins(mut self) -> Self {
        self.scenarios.extend(ScenarioRegistry::builtin().scenarios);
        self
    }

    /// Add or replace a scenario.
    pub fn scenario(mut self, key: impl Into<String>, config: TestConfig) -> Self {
        self.scenarios.insert(key.into(), config);
        self
    }

    /// Validate every scenario and freeze the registry.
    ///
    /// # Errors
    /// `InvalidScenario` for the first malformed scenario.
    pub fn build(self) -> HarnessResult<ScenarioRegistry> {
        for (key, config) in &self.scenarios {
            config.validate(key)?;
        }
        debug!(scenarios = self.scenarios.len(), "Scenario registry built");
        Ok(ScenarioRegistry {
            scenarios: self.scenarios,
        })
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn step(name: &str, seconds: u64, action: ActionKind) -> TestStep {
    TestStep::new(name, secs(seconds), action)
}

/// Steps shared by the phone app and idle scenarios.
fn connected_setup(voltage: f64) -> Vec<TestStep> {
    vec![
        step("default_settings", 5, ActionKind::ApplyDefaultSettings),
        step("lcd_on_unlock", 3, ActionKind::ScreenOnAndUnlock),
        step("init_hvpm", 2, ActionKind::SetVoltage).with_param("voltage", voltage),
        step("flight_mode", 2, ActionKind::EnableFlightMode),
        step("wifi_2g_connect", 15, ActionKind::ConnectWifi).with_param("network", "2g_primary"),
        step("bluetooth_on", 2, ActionKind::EnableBluetooth),
        step("home_clear_apps", 8, ActionKind::HomeAndClearApps),
    ]
}

/// LCD toggled by the power key every 3 s during a 30 s window.
fn screen_onoff() -> TestConfig {
    let voltage = 4.0;
    let stabilization = 60;
    let test = 30;

    TestConfig {
        name: "Screen On/Off".to_string(),
        description: "Display toggled every 3 s while measuring rail current".to_string(),
        target_voltage: voltage,
        stabilization_time: secs(stabilization),
        test_duration: secs(test),
        steps: vec![
            step("enable_slate_mode", 3, ActionKind::EnableSlateMode),
            step("default_settings", 5, ActionKind::ApplyDefaultSettings),
            step("lcd_on_unlock", 3, ActionKind::ScreenOnAndUnlock),
            step("init_hvpm", 2, ActionKind::SetVoltage).with_param("voltage", voltage),
            step("flight_mode", 2, ActionKind::EnableFlightMode),
            step("clear_apps", 8, ActionKind::ClearRecentApps),
            step("lcd_off", 2, ActionKind::ScreenOff),
            step("current_stabilization", stabilization, ActionKind::WaitStabilization),
            step("start_daq_monitoring", 2, ActionKind::StartSampling),
            step(
                "screen_onoff_test",
                test,
                ActionKind::RunMeasurement(MeasurementKind::ScreenToggle),
            )
            .with_param("interval_s", 3.0)
            .with_param("presses", 10_i64),
            step("stop_daq_monitoring", 2, ActionKind::StopSampling),
            step("save_results", 3, ActionKind::ExportResult),
            step("disable_slate_mode", 3, ActionKind::DisableSlateMode),
        ],
        quick_reset: QuickResetPlan {
            precondition: Some(ResetPrecondition::ScreenOff),
            stabilization: None,
        },
    }
}

/// Phone app opened, then dismissed with the back key halfway through.
fn phone_app() -> TestConfig {
    let voltage = 4.0;
    let stabilization = 10;
    let test = 10;

    let mut steps = connected_setup(voltage);
    steps.extend([
        step("current_stabilization", stabilization, ActionKind::WaitStabilization),
        step("start_daq", 2, ActionKind::StartSampling),
        step(
            "phone_app_test",
            test,
            ActionKind::RunMeasurement(MeasurementKind::PhoneApp),
        )
        .with_param("app", "com.android.dialer"),
        step("stop_daq", 2, ActionKind::StopSampling),
        step("export", 3, ActionKind::ExportResult),
    ]);

    TestConfig {
        name: "Phone App".to_string(),
        description: "Dialer launched and dismissed with Wi-Fi and Bluetooth on".to_string(),
        target_voltage: voltage,
        stabilization_time: secs(stabilization),
        test_duration: secs(test),
        steps,
        quick_reset: QuickResetPlan::default(),
    }
}

/// Connected idle: no interaction for five minutes.
fn idle_wait() -> TestConfig {
    let voltage = 4.0;
    let stabilization = 10;
    let test = 300;

    let mut steps = connected_setup(voltage);
    steps.extend([
        step("current_stabilization", stabilization, ActionKind::WaitStabilization),
        step("start_daq", 2, ActionKind::StartSampling),
        step("idle_wait", test, ActionKind::RunMeasurement(MeasurementKind::IdleWait)),
        step("stop_daq", 2, ActionKind::StopSampling),
        step("export", 3, ActionKind::ExportResult),
    ]);

    TestConfig {
        name: "Idle Wait".to_string(),
        description: "Connected standby current with the screen left as is".to_string(),
        target_voltage: voltage,
        stabilization_time: secs(stabilization),
        test_duration: secs(test),
        steps,
        quick_reset: QuickResetPlan::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_valid() {
        let registry = ScenarioRegistry::builder().with_builtins().build().unwrap();
        assert_eq!(registry.len(), 3);
        for key in [SCREEN_ONOFF, PHONE_APP, IDLE_WAIT] {
            assert!(registry.contains(key), "missing {key}");
        }
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let registry = ScenarioRegistry::builtin();
        assert!(matches!(
            registry.get("battery_drain"),
            Err(HarnessError::ScenarioNotFound(key)) if key == "battery_drain"
        ));
    }

    #[test]
    fn test_screen_onoff_definition() {
        let registry = ScenarioRegistry::builtin();
        let config = registry.get(SCREEN_ONOFF).unwrap();

        assert_eq!(config.steps.len(), 13);
        assert_eq!(config.test_duration, secs(30));
        assert_eq!(config.measurement_kind(), Some(MeasurementKind::ScreenToggle));
        assert_eq!(config.quick_reset.precondition, Some(ResetPrecondition::ScreenOff));

        let measured: Vec<&str> = config.measurement_steps().map(|s| s.name.as_str()).collect();
        assert_eq!(
            measured,
            vec!["start_daq_monitoring", "screen_onoff_test", "stop_daq_monitoring", "save_results"]
        );
    }

    #[test]
    fn test_phone_app_and_idle_share_setup() {
        let registry = ScenarioRegistry::builtin();
        let phone = registry.get(PHONE_APP).unwrap();
        let idle = registry.get(IDLE_WAIT).unwrap();

        assert_eq!(phone.steps[..7], idle.steps[..7]);
        assert_eq!(phone.steps.len(), 12);
        assert_eq!(idle.test_duration, secs(300));
    }

    #[test]
    fn test_builder_rejects_invalid_scenario() {
        let mut broken = ScenarioRegistry::builtin().get(PHONE_APP).unwrap().clone();
        broken.steps.retain(|s| s.action != ActionKind::StopSampling);

        let result = ScenarioRegistry::builder()
            .with_builtins()
            .scenario("broken", broken)
            .build();
        assert!(matches!(result, Err(HarnessError::InvalidScenario { .. })));
    }
}
