//! Explicit collaborator context.
//!
//! Every port handle the engine needs is constructed once and passed in
//! through a [`HarnessContext`]; nothing in the crate reaches for a global.

use std::sync::Arc;

use tracing::info;

use crate::acquisition::{PipelineSettings, SyntheticAcquisition};
use crate::config::HarnessConfig;
use crate::hardware::{
    Acquisition, DeviceControl, MockMode, PowerControl, RetryPolicy, SimulatedHandset,
    SimulatedPowerSupply,
};
use crate::results::ResultSink;
use crate::scenario::ScenarioRegistry;

/// Ports, registry and configuration shared by every run of an engine.
#[derive(Clone)]
pub struct HarnessContext {
    /// Programmable supply
    pub power: Arc<dyn PowerControl>,
    /// Device-control channel
    pub device: Arc<dyn DeviceControl>,
    /// DAQ; `None` means the synthetic generator is used
    pub acquisition: Option<Arc<dyn Acquisition>>,
    /// Result persistence
    pub sink: Arc<dyn ResultSink>,
    /// Scenario catalog
    pub registry: Arc<ScenarioRegistry>,
    /// Harness configuration
    pub config: Arc<HarnessConfig>,
}

impl HarnessContext {
    /// Context over the given ports with the built-in scenarios.
    pub fn new(
        power: Arc<dyn PowerControl>,
        device: Arc<dyn DeviceControl>,
        acquisition: Option<Arc<dyn Acquisition>>,
        sink: Arc<dyn ResultSink>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            power,
            device,
            acquisition,
            sink,
            registry: Arc::new(ScenarioRegistry::builtin()),
            config: Arc::new(config),
        }
    }

    /// Replace the scenario catalog.
    pub fn with_registry(mut self, registry: ScenarioRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Fully simulated bench writing to `sink`.
    ///
    /// Timing follows `config.simulation.mode`.
    pub fn simulated(config: HarnessConfig, sink: Arc<dyn ResultSink>) -> Self {
        let mode = config.simulation.mode;
        let acquisition = SyntheticAcquisition::new()
            .paced(mode == MockMode::Realistic)
            .with_baseline(config.simulation.baseline_current);
        info!(?mode, "Using simulated bench");

        Self::new(
            Arc::new(SimulatedPowerSupply::new(mode)),
            Arc::new(SimulatedHandset::new(mode)),
            Some(Arc::new(acquisition)),
            sink,
            config,
        )
    }

    /// Retry policy for verified device commands.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }

    /// Sampling pipeline tuning.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings::from_config(&self.config)
    }
}
