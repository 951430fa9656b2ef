//! Shared bench setup for the integration tests.
//!
//! Every bench uses instant mocks, a memory sink and short scenarios so the
//! suite runs in seconds.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use power_harness::acquisition::SyntheticAcquisition;
use power_harness::config::HarnessConfig;
use power_harness::experiment::{HarnessContext, RunEngine};
use power_harness::hardware::{MockMode, SimulatedHandset, SimulatedPowerSupply};
use power_harness::results::MemoryResultSink;
use power_harness::scenario::{
    ActionKind, MeasurementKind, QuickResetPlan, ResetPrecondition, ScenarioRegistry, TestConfig,
    TestStep,
};

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Harness configuration tuned for fast tests.
pub fn fast_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.simulation.mode = MockMode::Instant;
    config.acquisition.batch = ms(100);
    config.retry.backoff = ms(5);
    config.timing.inter_iteration_pause = ms(20);
    config.timing.step_timeout_margin = Duration::from_secs(5);
    config
}

/// Full phone-app style flow with a `body` long measurement window.
pub fn app_scenario(body: Duration) -> TestConfig {
    TestConfig {
        name: "Short App".to_string(),
        description: "phone app flow with a short window".to_string(),
        target_voltage: 4.0,
        stabilization_time: ms(50),
        test_duration: body,
        steps: vec![
            TestStep::new("default_settings", ms(0), ActionKind::ApplyDefaultSettings),
            TestStep::new("lcd_on_unlock", ms(0), ActionKind::ScreenOnAndUnlock),
            TestStep::new("init_hvpm", ms(0), ActionKind::SetVoltage).with_param("voltage", 4.0),
            TestStep::new("flight_mode", ms(0), ActionKind::EnableFlightMode),
            TestStep::new("wifi_2g_connect", ms(0), ActionKind::ConnectWifi)
                .with_param("network", "2g_primary"),
            TestStep::new("bluetooth_on", ms(0), ActionKind::EnableBluetooth),
            TestStep::new("home_clear_apps", ms(0), ActionKind::HomeAndClearApps),
            TestStep::new("current_stabilization", ms(50), ActionKind::WaitStabilization),
            TestStep::new("start_daq", ms(0), ActionKind::StartSampling),
            TestStep::new(
                "phone_app_test",
                body,
                ActionKind::RunMeasurement(MeasurementKind::PhoneApp),
            )
            .with_param("app", "com.android.dialer"),
            TestStep::new("stop_daq", ms(0), ActionKind::StopSampling),
            TestStep::new("save_results", ms(0), ActionKind::ExportResult),
        ],
        quick_reset: QuickResetPlan {
            precondition: Some(ResetPrecondition::ScreenOff),
            stabilization: Some(ms(20)),
        },
    }
}

/// Idle measurement whose body lasts `body`; sampling covers `window`.
pub fn idle_scenario(body: Duration, window: Duration) -> TestConfig {
    TestConfig {
        name: "Idle".to_string(),
        description: "screen off idle".to_string(),
        target_voltage: 4.0,
        stabilization_time: ms(0),
        test_duration: window,
        steps: vec![
            TestStep::new("init_hvpm", ms(0), ActionKind::SetVoltage),
            TestStep::new("lcd_off", ms(0), ActionKind::ScreenOff),
            TestStep::new("start_daq", ms(0), ActionKind::StartSampling),
            TestStep::new("idle", body, ActionKind::RunMeasurement(MeasurementKind::IdleWait)),
            TestStep::new("stop_daq", ms(0), ActionKind::StopSampling),
            TestStep::new("save_results", ms(0), ActionKind::ExportResult),
        ],
        quick_reset: QuickResetPlan::default(),
    }
}

/// Engine plus handles on its simulated devices.
pub struct Bench {
    pub engine: RunEngine,
    pub sink: Arc<MemoryResultSink>,
    pub handset: Arc<SimulatedHandset>,
    pub supply: Arc<SimulatedPowerSupply>,
}

pub struct BenchBuilder {
    config: HarnessConfig,
    handset: SimulatedHandset,
    acquisition: SyntheticAcquisition,
    scenarios: Vec<(String, TestConfig)>,
}

impl BenchBuilder {
    pub fn new() -> Self {
        Self {
            config: fast_config(),
            handset: SimulatedHandset::new(MockMode::Instant),
            acquisition: SyntheticAcquisition::new(),
            scenarios: Vec::new(),
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut HarnessConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn handset(mut self, handset: SimulatedHandset) -> Self {
        self.handset = handset;
        self
    }

    pub fn acquisition(mut self, acquisition: SyntheticAcquisition) -> Self {
        self.acquisition = acquisition;
        self
    }

    pub fn scenario(mut self, key: &str, config: TestConfig) -> Self {
        self.scenarios.push((key.to_string(), config));
        self
    }

    pub fn build(self) -> Bench {
        let registry = self
            .scenarios
            .into_iter()
            .fold(ScenarioRegistry::builder(), |b, (key, config)| b.scenario(&key, config))
            .build()
            .expect("test scenarios are valid");

        let sink = Arc::new(MemoryResultSink::new());
        let handset = Arc::new(self.handset);
        let supply = Arc::new(SimulatedPowerSupply::new(MockMode::Instant));
        let context = HarnessContext::new(
            supply.clone(),
            handset.clone(),
            Some(Arc::new(self.acquisition)),
            sink.clone(),
            self.config,
        )
        .with_registry(registry);

        Bench {
            engine: RunEngine::new(context),
            sink,
            handset,
            supply,
        }
    }
}

/// Poll until the engine reaches step `index`, or panic after `within`.
pub async fn wait_for_step(engine: &RunEngine, index: usize, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let state = engine.snapshot();
        if state.status.is_busy() && state.current_step_index >= index {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine never reached step {index}: {state:?}"
        );
        tokio::time::sleep(ms(10)).await;
    }
}
