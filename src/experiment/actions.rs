//! Step dispatch.
//!
//! [`StepRunner`] holds everything one run needs while executing steps: the
//! run's coordinator, its sampling pipeline, the session handed back at
//! `stop_sampling` and the step log. `execute` is a total match over
//! [`ActionKind`]; adding a variant does not compile until it is handled here.
//!
//! Handlers return `Ok(true)` on success and `Ok(false)` when the bench did
//! not do what was asked. Errors are reserved for the taxonomy in
//! [`HarnessError`]; the sequencer maps both through the step's fault policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn, Level};

use crate::acquisition::{
    CollectionOutcome, CollectionRequest, SamplingPipeline, StartStopCoordinator, StopFlag,
};
use crate::error::{HarnessError, HarnessResult, Port};
use crate::experiment::context::HarnessContext;
use crate::experiment::events::EventSink;
use crate::experiment::plan::RunPlan;
use crate::experiment::state::StepRecord;
use crate::hardware::{verified_command, DeviceCheck, RetryPolicy};
use crate::results::{ExportReceipt, ResultSet};
use crate::scenario::{ActionKind, MeasurementKind, ResetPrecondition, TestStep};

/// Read-back tolerance when verifying the supply output.
const VOLTAGE_TOLERANCE: f64 = 0.05;

/// Display sleep timeout set while the device is under test.
const SCREEN_TIMEOUT: Duration = Duration::from_secs(600);

const DEFAULT_NETWORK: &str = "2g_primary";
const DEFAULT_APP: &str = "com.android.dialer";

/// Per-run step executor.
pub(crate) struct StepRunner<'a> {
    ctx: &'a HarnessContext,
    plan: &'a RunPlan,
    run_id: &'a str,
    events: &'a EventSink,
    coordinator: Arc<StartStopCoordinator>,
    pipeline: SamplingPipeline,
    retry: RetryPolicy,
    collected: Option<CollectionOutcome>,
    records: Vec<StepRecord>,
    export: Option<ExportReceipt>,
    started_at: DateTime<Local>,
}

impl<'a> StepRunner<'a> {
    pub(crate) fn new(
        ctx: &'a HarnessContext,
        plan: &'a RunPlan,
        run_id: &'a str,
        events: &'a EventSink,
        stop: StopFlag,
    ) -> Self {
        let timing = &ctx.config.timing;
        Self {
            ctx,
            plan,
            run_id,
            events,
            coordinator: Arc::new(StartStopCoordinator::new(
                stop,
                timing.start_deadline,
                timing.wait_slice,
            )),
            pipeline: SamplingPipeline::new(ctx.acquisition.clone(), ctx.pipeline_settings()),
            retry: ctx.retry_policy(),
            collected: None,
            records: Vec::new(),
            export: None,
            started_at: Local::now(),
        }
    }

    pub(crate) fn coordinator(&self) -> &StartStopCoordinator {
        &self.coordinator
    }

    pub(crate) fn record(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub(crate) fn into_parts(self) -> (Vec<StepRecord>, Option<CollectionOutcome>, Option<ExportReceipt>) {
        (self.records, self.collected, self.export)
    }

    /// Run one step's action.
    pub(crate) async fn execute(&mut self, step: &TestStep) -> HarnessResult<bool> {
        self.coordinator.stop_flag().check()?;
        let ctx = self.ctx;
        let device = ctx.device.as_ref();

        match step.action {
            ActionKind::EnableSlateMode => self.slate_mode(true).await,
            ActionKind::DisableSlateMode => self.slate_mode(false).await,
            ActionKind::ApplyDefaultSettings => {
                let report = device.apply_default_settings().await;
                if report.is_complete() {
                    info!(applied = report.applied, "Default settings applied");
                    Ok(true)
                } else {
                    Err(HarnessError::PartialConfigurationFailure {
                        applied: report.applied,
                        total: report.total,
                    })
                }
            }
            ActionKind::ScreenOnAndUnlock => {
                let on = self
                    .verified("turn_screen_on", || device.turn_screen_on(), || {
                        device.check(DeviceCheck::ScreenOn)
                    })
                    .await?;
                let unlocked = on
                    && self
                        .verified("unlock", || device.unlock(), || device.check(DeviceCheck::Unlocked))
                        .await?;
                if unlocked && !device.set_screen_timeout(SCREEN_TIMEOUT).await {
                    warn!("Screen timeout not applied; display may sleep during the run");
                }
                Ok(unlocked)
            }
            ActionKind::SetVoltage => {
                let volts = step.f64_param("voltage", self.plan.config.target_voltage);
                self.set_voltage(volts).await
            }
            ActionKind::EnableFlightMode => {
                self.verified("enable_flight_mode", || device.enable_flight_mode(), || {
                    device.check(DeviceCheck::FlightMode)
                })
                .await
            }
            ActionKind::ConnectWifi => self.connect_wifi(step).await,
            ActionKind::EnableBluetooth => {
                self.verified("enable_bluetooth", || device.enable_bluetooth(), || {
                    device.check(DeviceCheck::BluetoothOn)
                })
                .await
            }
            ActionKind::HomeAndClearApps => {
                let home = device.press_home().await;
                if !home {
                    warn!("Home key rejected");
                }
                let cleared = self.clear_recent_apps().await?;
                Ok(home && cleared)
            }
            ActionKind::ClearRecentApps => self.clear_recent_apps().await,
            ActionKind::ScreenOff => self.screen_off().await,
            ActionKind::WaitStabilization => {
                match ctx.power.read_voltage().await {
                    Ok(volts) => info!(volts, settle = ?step.duration, "Waiting for current to settle"),
                    Err(e) => warn!(error = %e, "Supply read-back failed before stabilization"),
                }
                Ok(true)
            }
            ActionKind::QuickReset => self.quick_reset().await,
            ActionKind::StartSampling => self.start_sampling(),
            ActionKind::RunMeasurement(kind) => self.measure(step, kind).await,
            ActionKind::StopSampling => self.stop_sampling().await,
            ActionKind::ExportResult => self.export().await,
        }
    }

    /// Stop a collection the run left behind.
    pub(crate) async fn teardown(&mut self) {
        if !self.pipeline.is_active() {
            return;
        }
        debug!("Stopping sampling pipeline at teardown");
        if let Some(outcome) = self.pipeline.stop().await {
            if self.collected.is_none() {
                self.collected = Some(outcome);
            }
        }
    }

    async fn verified<C, CF, V, VF>(&self, label: &str, command: C, verify: V) -> HarnessResult<bool>
    where
        C: FnMut() -> CF,
        CF: std::future::Future<Output = bool>,
        V: FnMut() -> VF,
        VF: std::future::Future<Output = bool>,
    {
        verified_command(label, self.retry, self.coordinator.stop_flag(), command, verify).await
    }

    async fn slate_mode(&self, enabled: bool) -> HarnessResult<bool> {
        let device = self.ctx.device.as_ref();
        self.verified(
            "set_battery_slate_mode",
            move || device.set_battery_slate_mode(enabled),
            move || device.check(DeviceCheck::SlateMode(enabled)),
        )
        .await
    }

    async fn set_voltage(&self, volts: f64) -> HarnessResult<bool> {
        let power = self.ctx.power.as_ref();
        if !power.is_connected().await {
            return Err(HarnessError::unavailable(Port::Power, "supply not reachable"));
        }
        let applied = self
            .verified(
                "set_voltage",
                move || power.set_voltage(volts),
                move || async move {
                    match power.read_voltage().await {
                        Ok(read) => (read - volts).abs() <= VOLTAGE_TOLERANCE,
                        Err(e) => {
                            warn!(error = %e, "Supply read-back failed");
                            false
                        }
                    }
                },
            )
            .await?;
        if applied {
            info!(volts, "Supply output set");
        }
        Ok(applied)
    }

    async fn connect_wifi(&self, step: &TestStep) -> HarnessResult<bool> {
        let key = step.str_param("network").unwrap_or(DEFAULT_NETWORK);
        let Some(network) = self.ctx.config.networks.get(key) else {
            self.events
                .log(Level::WARN, format!("Wi-Fi network '{key}' is not configured"));
            return Ok(false);
        };
        let device = self.ctx.device.as_ref();
        let ssid = network.ssid.clone();
        self.verified(
            "connect_wifi",
            move || device.connect_wifi(network),
            move || device.check(DeviceCheck::WifiConnected(ssid.clone())),
        )
        .await
    }

    async fn clear_recent_apps(&self) -> HarnessResult<bool> {
        let device = self.ctx.device.as_ref();
        self.verified("clear_recent_apps", || device.clear_recent_apps(), || {
            device.check(DeviceCheck::RecentsCleared)
        })
        .await
    }

    async fn screen_off(&self) -> HarnessResult<bool> {
        let device = self.ctx.device.as_ref();
        self.verified("turn_screen_off", || device.turn_screen_off(), || {
            device.check(DeviceCheck::ScreenOff)
        })
        .await
    }

    async fn quick_reset(&self) -> HarnessResult<bool> {
        let device = self.ctx.device.as_ref();
        let home = device.press_home().await;
        let cleared = self.clear_recent_apps().await?;
        let precondition = match self.plan.config.quick_reset.precondition {
            Some(ResetPrecondition::ScreenOff) => self.screen_off().await?,
            None => true,
        };
        info!(
            iteration = self.plan.iteration_index,
            home, cleared, precondition, "Quick reset done"
        );
        Ok(home && cleared && precondition)
    }

    fn start_sampling(&mut self) -> HarnessResult<bool> {
        let request = CollectionRequest::from_config(
            &self.ctx.config.acquisition,
            self.plan.config.test_duration,
        );
        self.pipeline.start(request, Arc::clone(&self.coordinator))?;
        Ok(true)
    }

    async fn measure(&self, step: &TestStep, kind: MeasurementKind) -> HarnessResult<bool> {
        if !self.pipeline.is_active() {
            warn!("Measurement body starting without an active collection");
        }
        let device = self.ctx.device.as_ref();
        let window = step.duration;

        self.coordinator.signal_start();
        let t0 = Instant::now();

        let ok = match kind {
            MeasurementKind::ScreenToggle => {
                let interval_s = step.f64_param("interval_s", 3.0);
                let interval = Duration::try_from_secs_f64(interval_s.max(0.01)).map_err(|e| {
                    HarnessError::StepFailure {
                        step: step.name.clone(),
                        reason: format!("interval_s {interval_s}: {e}"),
                    }
                })?;
                let presses = u32::try_from(step.i64_param("presses", 10)).unwrap_or(0);

                let mut screen_on = device.turn_screen_on().await;
                let mut failures = u32::from(!screen_on);
                for press in 1..=presses {
                    let Some(at) = interval.checked_mul(press).filter(|at| *at < window) else {
                        break;
                    };
                    self.sleep_until(t0, at).await?;
                    let toggled = if screen_on {
                        device.turn_screen_off().await
                    } else {
                        device.turn_screen_on().await
                    };
                    if toggled {
                        screen_on = !screen_on;
                        debug!(press, screen_on, "Power key toggled display");
                    } else {
                        failures += 1;
                        warn!(press, "Display toggle rejected");
                    }
                }
                self.sleep_until(t0, window).await?;
                failures == 0
            }
            MeasurementKind::PhoneApp => {
                let app = step.str_param("app").unwrap_or(DEFAULT_APP);
                let opened = device.open_app(app).await;
                if !opened {
                    warn!(app, "App did not open");
                }
                self.sleep_until(t0, window / 2).await?;
                let back = device.press_back().await;
                self.sleep_until(t0, window).await?;
                opened && back
            }
            MeasurementKind::IdleWait => {
                self.sleep_until(t0, window).await?;
                true
            }
        };

        info!(?kind, elapsed = ?t0.elapsed(), ok, "Measurement body finished");
        Ok(ok)
    }

    async fn sleep_until(&self, t0: Instant, offset: Duration) -> HarnessResult<()> {
        self.coordinator
            .sleep(offset.saturating_sub(t0.elapsed()))
            .await
    }

    async fn stop_sampling(&mut self) -> HarnessResult<bool> {
        let grace = self.ctx.config.acquisition.batch * 2;
        let Some(outcome) = self.pipeline.drain(grace, self.coordinator.slice()).await else {
            self.events
                .log(Level::WARN, "No active collection to stop");
            return Ok(false);
        };

        let complete = outcome.is_complete();
        let cancelled = outcome.error.as_ref().is_some_and(HarnessError::is_cancellation);
        match &outcome.error {
            Some(_) if cancelled => {}
            Some(e) => self
                .events
                .log(Level::WARN, format!("Sampling ended early: {e}")),
            None if !complete => self.events.log(
                Level::WARN,
                format!(
                    "Collected {}/{} samples",
                    outcome.session.len(),
                    outcome.session.expected_sample_count()
                ),
            ),
            None => {}
        }

        self.collected = Some(outcome);
        if cancelled {
            return Err(HarnessError::CancellationRequested);
        }
        Ok(complete)
    }

    async fn export(&mut self) -> HarnessResult<bool> {
        self.coordinator.stop_flag().check()?;

        let samples = match &self.collected {
            Some(outcome) if !outcome.session.is_empty() => outcome.session.samples().to_vec(),
            _ => {
                self.events
                    .log(Level::WARN, "No samples collected; nothing to export");
                return Ok(true);
            }
        };

        let acquisition = &self.ctx.config.acquisition;
        let result = ResultSet {
            run_id: self.run_id.to_string(),
            scenario_key: self.plan.scenario_key.clone(),
            scenario_name: self.plan.config.name.clone(),
            iteration_index: self.plan.iteration_index,
            iteration_count: self.plan.iteration_count,
            channel_labels: acquisition.channel_labels(),
            unit: self.ctx.config.results.unit,
            output_rate: acquisition.output_rate(),
            samples,
            steps: self.records.clone(),
            started_at: self.started_at,
        };

        let sink = Arc::clone(&self.ctx.sink);
        let receipt = tokio::task::spawn_blocking(move || sink.export(&result))
            .await
            .map_err(|e| HarnessError::StepFailure {
                step: "export".to_string(),
                reason: e.to_string(),
            })??;

        self.events.log(
            Level::INFO,
            format!("Exported {} rows as {}", receipt.rows, receipt.name),
        );
        self.export = Some(receipt);
        Ok(true)
    }
}
