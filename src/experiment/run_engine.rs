//! RunEngine: the step sequencer.
//!
//! The RunEngine walks a [`RunPlan`] step by step against the ports in its
//! [`HarnessContext`], applying each action's fault policy.
//!
//! # Architecture
//!
//! ```text
//! start()/run() ──claim Idle──> Initializing ──> Running
//!                                                  │ for each step:
//!                                                  │   stop check
//!                                                  │   dispatch (time budget, panics caught)
//!                                                  │   fault policy
//!                                                  │   sliced fixed wait
//!                                                  │   progress event
//!                                                  ▼
//!                                Completed | Failed | Stopped ──teardown──> Idle
//!                                    │
//!                                    └── more iterations ──> Initializing (held)
//! ```
//!
//! At most one run holds the engine. `start` spawns the run (and any repeat
//! iterations) on a tokio task; `run` executes a single plan on the caller's
//! task. Both reject a busy engine without touching the run in progress.
//! A repeat sequence holds the engine from its first claim until its last
//! iteration ends, pauses included.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = RunEngine::new(HarnessContext::simulated(config, sink));
//! let mut events = engine.subscribe();
//!
//! assert!(engine.start("screen_onoff", RunOptions::default()));
//! let report = engine.wait().await.unwrap();
//! println!("{}", report.message());
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Level};
use uuid::Uuid;

use crate::acquisition::StopFlag;
use crate::error::{HarnessError, HarnessResult};
use crate::experiment::actions::StepRunner;
use crate::experiment::context::HarnessContext;
use crate::experiment::events::{EngineEvent, EventSink};
use crate::experiment::plan::RunPlan;
use crate::experiment::repeat::{RepeatController, RepeatReport};
use crate::experiment::state::{RunReport, RunState, RunStatus, StepRecord};
use crate::scenario::{FaultPolicy, TestConfig, TestStep};

/// Options for [`RunEngine::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Iterations to run; iteration 1 is the full scenario
    pub repeat_count: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { repeat_count: 1 }
    }
}

impl RunOptions {
    /// Run the scenario `count` times.
    pub fn repeat(count: u32) -> Self {
        Self {
            repeat_count: count.max(1),
        }
    }
}

/// How the sequencer proceeds after a step.
enum StepVerdict {
    Done { success: bool, tolerated: bool },
    Fail(String),
    Stop,
}

struct EngineInner {
    context: HarnessContext,
    state: RwLock<RunState>,
    stop: StopFlag,
    events: EventSink,
    worker: Mutex<Option<JoinHandle<RepeatReport>>>,
}

/// Scenario executor. Cloning shares the engine.
#[derive(Clone)]
pub struct RunEngine {
    inner: Arc<EngineInner>,
}

impl RunEngine {
    /// Create an idle engine over `context`.
    pub fn new(context: HarnessContext) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                context,
                state: RwLock::new(RunState::default()),
                stop: StopFlag::new(),
                events: EventSink::default(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Ports, registry and configuration.
    pub fn context(&self) -> &HarnessContext {
        &self.inner.context
    }

    /// Receive progress and log events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> RunStatus {
        self.inner.state.read().status
    }

    /// Copy of the run state.
    pub fn snapshot(&self) -> RunState {
        self.inner.state.read().clone()
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.inner.events
    }

    pub(crate) fn stop_flag(&self) -> &StopFlag {
        &self.inner.stop
    }

    /// Ask the active run to stop at its next slice boundary.
    ///
    /// The run ends `Stopped` and nothing further is exported.
    pub fn request_stop(&self) {
        self.inner.stop.request();
        let busy = {
            let mut state = self.inner.state.write();
            if state.status.is_busy() {
                state.stop_requested = true;
            }
            state.status.is_busy()
        };
        if busy {
            self.inner.events.log(Level::INFO, "Stop requested");
        }
    }

    /// Start `scenario_key` in the background.
    ///
    /// Returns `false`, leaving any run in progress untouched, when the
    /// engine is not idle, the scenario is unknown or no tokio runtime is
    /// available. Use [`wait`](Self::wait) to collect the outcome.
    pub fn start(&self, scenario_key: &str, options: RunOptions) -> bool {
        let config = match self.inner.context.registry.get(scenario_key) {
            Ok(config) => config.clone(),
            Err(e) => {
                self.inner.events.log(Level::ERROR, e.to_string());
                return false;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("RunEngine::start called outside a tokio runtime");
            return false;
        };

        let count = options.repeat_count.max(1);
        let first = self.plan(scenario_key, &config, 1, count);
        if let Err(e) = self.claim(&first) {
            warn!(scenario = scenario_key, error = %e, "Start rejected");
            return false;
        }
        self.inner.stop.reset();

        let controller = RepeatController::new(self.clone());
        let handle = runtime.spawn(async move { controller.run_claimed(config, first).await });
        *self.inner.worker.lock() = Some(handle);
        true
    }

    /// Wait for the run launched by [`start`](Self::start).
    ///
    /// Returns `None` when nothing was started or the outcome was already taken.
    pub async fn wait(&self) -> Option<RepeatReport> {
        let handle = self.inner.worker.lock().take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Run task terminated abnormally");
                None
            }
        }
    }

    /// Execute one plan on the caller's task.
    ///
    /// # Errors
    /// `EngineBusy` if another run holds the engine.
    pub async fn run(&self, plan: RunPlan) -> HarnessResult<RunReport> {
        self.claim(&plan)?;
        self.inner.stop.reset();
        Ok(self.execute_claimed(plan, false).await)
    }

    /// Run a registered scenario once.
    ///
    /// # Errors
    /// `ScenarioNotFound` or `EngineBusy`.
    pub async fn run_scenario(&self, scenario_key: &str) -> HarnessResult<RunReport> {
        let config = self.inner.context.registry.get(scenario_key)?.clone();
        self.run(RunPlan::full(scenario_key, &config)).await
    }

    /// Plan for iteration `index` of `count` with the configured reset wait.
    pub fn plan(&self, scenario_key: &str, config: &TestConfig, index: u32, count: u32) -> RunPlan {
        let reset = self.inner.context.config.timing.quick_reset_stabilization;
        RunPlan::for_iteration(scenario_key, config, index, count, reset)
    }

    /// Move Idle to Initializing for `plan`.
    pub(crate) fn claim(&self, plan: &RunPlan) -> HarnessResult<()> {
        {
            let mut state = self.inner.state.write();
            if !state.status.can_start() {
                return Err(HarnessError::EngineBusy(state.status));
            }
            *state = RunState {
                status: RunStatus::Initializing,
                current_step_index: 0,
                total_steps: plan.steps.len(),
                stop_requested: false,
                scenario_key: Some(plan.scenario_key.clone()),
                iteration_index: plan.iteration_index,
                iteration_count: plan.iteration_count,
                run_id: None,
            };
        }
        self.inner
            .events
            .emit(EngineEvent::StatusChanged(RunStatus::Initializing));
        Ok(())
    }

    /// Run a plan the caller has already claimed.
    ///
    /// With `more` set, a completed iteration keeps the engine claimed for
    /// the next one instead of returning it to `Idle`.
    pub(crate) async fn execute_claimed(&self, plan: RunPlan, more: bool) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "run",
            scenario = %plan.scenario_key,
            iteration = plan.iteration_index,
            run_id = %run_id
        );
        self.sequence(&plan, &run_id, more).instrument(span).await
    }

    /// Keep the claim after iteration `plan` for the one that follows.
    fn hold_for_next(&self, plan: &RunPlan) {
        {
            let mut state = self.inner.state.write();
            state.status = RunStatus::Initializing;
            state.current_step_index = 0;
            state.iteration_index = plan.iteration_index + 1;
            state.run_id = None;
        }
        self.inner
            .events
            .emit(EngineEvent::StatusChanged(RunStatus::Initializing));
    }

    /// Point a held claim at the next iteration's `plan`.
    pub(crate) fn advance(&self, plan: &RunPlan) {
        let mut state = self.inner.state.write();
        state.current_step_index = 0;
        state.total_steps = plan.steps.len();
        state.iteration_index = plan.iteration_index;
        state.iteration_count = plan.iteration_count;
        state.run_id = None;
    }

    /// Give up a held claim, returning the engine to `Idle`.
    pub(crate) fn release(&self) {
        let released = {
            let mut state = self.inner.state.write();
            let held = state.status.is_busy();
            if held {
                state.status = RunStatus::Idle;
            }
            held
        };
        if released {
            self.inner
                .events
                .emit(EngineEvent::StatusChanged(RunStatus::Idle));
        }
    }

    async fn sequence(&self, plan: &RunPlan, run_id: &str, more: bool) -> RunReport {
        let inner = &self.inner;
        let events = &inner.events;
        let total = plan.steps.len();

        inner.state.write().run_id = Some(run_id.to_string());
        events.log(
            Level::INFO,
            format!(
                "Starting '{}' iteration {}/{} ({} steps)",
                plan.config.name, plan.iteration_index, plan.iteration_count, total
            ),
        );
        self.check_ports().await;

        let mut runner = StepRunner::new(&inner.context, plan, run_id, events, inner.stop.clone());
        self.set_status(RunStatus::Running);

        let mut status = RunStatus::Completed;
        let mut failed_step = None;
        let mut message = None;

        for (index, step) in plan.steps.iter().enumerate() {
            if inner.stop.is_requested() {
                status = RunStatus::Stopped;
                message = Some(format!("Stopped before step '{}'", step.name));
                break;
            }
            inner.state.write().current_step_index = index;
            events.log(Level::INFO, format!("[{}/{}] {}", index + 1, total, step.name));

            let began = Instant::now();
            let verdict = self.dispatch(&mut runner, step).await;
            let elapsed = began.elapsed();

            let (success, tolerated) = match &verdict {
                StepVerdict::Done { success, tolerated } => (*success, *tolerated),
                StepVerdict::Fail(_) | StepVerdict::Stop => (false, false),
            };
            let record = StepRecord {
                index,
                name: step.name.clone(),
                action: step.action,
                success,
                tolerated,
                elapsed,
            };
            runner.record(record.clone());
            events.emit(EngineEvent::StepCompleted(record));

            match verdict {
                StepVerdict::Done { .. } => {}
                StepVerdict::Fail(reason) => {
                    status = RunStatus::Failed;
                    message = Some(format!("Step '{}' failed: {}", step.name, reason));
                    failed_step = Some(step.name.clone());
                    break;
                }
                StepVerdict::Stop => {
                    status = RunStatus::Stopped;
                    message = Some(format!("Stopped during step '{}'", step.name));
                    break;
                }
            }

            if step.action.is_fixed_wait() && runner.coordinator().sleep(step.duration).await.is_err()
            {
                status = RunStatus::Stopped;
                message = Some(format!("Stopped while waiting in step '{}'", step.name));
                break;
            }

            events.progress(index + 1, total, step.name.clone());
        }

        self.set_status(status);
        runner.teardown().await;
        let (steps, collected, export) = runner.into_parts();

        let message = message.unwrap_or_else(|| {
            let tolerated = steps.iter().filter(|s| s.tolerated).count();
            format!(
                "'{}' completed: {} steps, {} tolerated failure(s)",
                plan.config.name,
                steps.len(),
                tolerated
            )
        });

        let report = RunReport {
            run_id: run_id.to_string(),
            scenario_key: plan.scenario_key.clone(),
            iteration_index: plan.iteration_index,
            iteration_count: plan.iteration_count,
            status,
            message: message.clone(),
            failed_step,
            steps,
            samples_collected: collected.as_ref().map_or(0, |o| o.session.len()),
            pipeline_error: collected
                .as_ref()
                .and_then(|o| o.error.as_ref())
                .map(ToString::to_string),
            export,
        };

        let level = match status {
            RunStatus::Completed => Level::INFO,
            RunStatus::Stopped => Level::WARN,
            _ => Level::ERROR,
        };
        events.log(level, message.clone());

        if more && status == RunStatus::Completed {
            self.hold_for_next(plan);
        } else {
            self.set_status(RunStatus::Idle);
        }
        events.emit(EngineEvent::RunFinished { status, message });
        report
    }

    async fn dispatch(&self, runner: &mut StepRunner<'_>, step: &TestStep) -> StepVerdict {
        let budget = step.duration + self.inner.context.config.timing.step_timeout_margin;
        let attempt = tokio::time::timeout(
            budget,
            AssertUnwindSafe(runner.execute(step)).catch_unwind(),
        )
        .await;

        let outcome = match attempt {
            Err(_) => Err(HarnessError::CommandTimeout {
                operation: step.name.clone(),
                timeout: budget,
            }),
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!(step = %step.name, %reason, "Step handler panicked");
                return StepVerdict::Fail(format!("handler panicked: {reason}"));
            }
            Ok(Ok(result)) => result,
        };

        match outcome {
            Ok(true) => StepVerdict::Done {
                success: true,
                tolerated: false,
            },
            Ok(false) => self.apply_policy(step, "reported failure".to_string()),
            Err(e) if e.is_cancellation() => StepVerdict::Stop,
            Err(e) if e.is_recoverable() => self.apply_policy(step, e.to_string()),
            Err(e) => {
                error!(step = %step.name, error = %e, "Step raised a fatal error");
                StepVerdict::Fail(e.to_string())
            }
        }
    }

    fn apply_policy(&self, step: &TestStep, reason: String) -> StepVerdict {
        match step.action.fault_policy() {
            FaultPolicy::BestEffort => {
                self.inner.events.log(
                    Level::WARN,
                    format!("Best-effort step '{}' {}; continuing", step.name, reason),
                );
                StepVerdict::Done {
                    success: false,
                    tolerated: true,
                }
            }
            FaultPolicy::Critical => StepVerdict::Fail(reason),
        }
    }

    async fn check_ports(&self) {
        let ctx = &self.inner.context;
        if !ctx.power.is_connected().await {
            self.inner
                .events
                .log(Level::WARN, "Power supply not reachable");
        }
        if !ctx.device.is_connected().await {
            self.inner
                .events
                .log(Level::WARN, "Device control channel not reachable");
        }
        match &ctx.acquisition {
            Some(daq) if daq.is_connected() => {}
            _ => info!("No acquisition hardware; synthetic samples will be used"),
        }
    }

    fn set_status(&self, status: RunStatus) {
        self.inner.state.write().status = status;
        self.inner.events.emit(EngineEvent::StatusChanged(status));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::HarnessConfig;
    use crate::hardware::{FaultPlan, MockMode, SimulatedHandset, SimulatedPowerSupply};
    use crate::acquisition::SyntheticAcquisition;
    use crate::results::MemoryResultSink;
    use crate::scenario::{
        ActionKind, MeasurementKind, QuickResetPlan, ScenarioRegistry, TestConfig, TestStep,
    };

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn quick_config() -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.simulation.mode = MockMode::Instant;
        config.retry.backoff = ms(5);
        config.timing.step_timeout_margin = Duration::from_secs(5);
        config.timing.quick_reset_stabilization = ms(20);
        config.timing.inter_iteration_pause = ms(20);
        config
    }

    fn short_scenario() -> TestConfig {
        TestConfig {
            name: "Short".to_string(),
            description: String::new(),
            target_voltage: 4.0,
            stabilization_time: ms(20),
            test_duration: ms(200),
            steps: vec![
                TestStep::new("default_settings", ms(0), ActionKind::ApplyDefaultSettings),
                TestStep::new("init_hvpm", ms(0), ActionKind::SetVoltage),
                TestStep::new("settle", ms(20), ActionKind::WaitStabilization),
                TestStep::new("start", ms(0), ActionKind::StartSampling),
                TestStep::new(
                    "body",
                    ms(200),
                    ActionKind::RunMeasurement(MeasurementKind::IdleWait),
                ),
                TestStep::new("stop", ms(0), ActionKind::StopSampling),
                TestStep::new("export", ms(0), ActionKind::ExportResult),
            ],
            quick_reset: QuickResetPlan::default(),
        }
    }

    fn engine_with(handset: SimulatedHandset, supply: SimulatedPowerSupply) -> (RunEngine, Arc<MemoryResultSink>) {
        let sink = Arc::new(MemoryResultSink::new());
        let registry = ScenarioRegistry::builder()
            .scenario("short", short_scenario())
            .build()
            .unwrap();
        let context = HarnessContext::new(
            Arc::new(supply),
            Arc::new(handset),
            Some(Arc::new(SyntheticAcquisition::new())),
            sink.clone(),
            quick_config(),
        )
        .with_registry(registry);
        (RunEngine::new(context), sink)
    }

    fn engine() -> (RunEngine, Arc<MemoryResultSink>) {
        engine_with(
            SimulatedHandset::new(MockMode::Instant),
            SimulatedPowerSupply::new(MockMode::Instant),
        )
    }

    #[tokio::test]
    async fn test_run_completes_and_exports() {
        let (engine, sink) = engine();
        let report = engine.run_scenario("short").await.unwrap();

        assert_eq!(report.status, RunStatus::Completed, "{}", report.message);
        assert_eq!(report.steps.len(), 7);
        assert_eq!(report.samples_collected, 200);
        assert_eq!(sink.names(), vec!["short"]);
        assert_eq!(engine.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_critical_failure_names_the_step() {
        let (engine, sink) = engine_with(
            SimulatedHandset::new(MockMode::Instant),
            SimulatedPowerSupply::new(MockMode::Instant).with_faults(FaultPlan::none().fail("set_voltage")),
        );
        let report = engine.run_scenario("short").await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_step.as_deref(), Some("init_hvpm"));
        assert!(sink.is_empty());
        assert_eq!(engine.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failed() {
        let (engine, _sink) = engine_with(
            SimulatedHandset::new(MockMode::Instant),
            SimulatedPowerSupply::new(MockMode::Instant).with_faults(FaultPlan::none().panic("set_voltage")),
        );
        let report = engine.run_scenario("short").await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.message.contains("panicked"), "{}", report.message);
        assert_eq!(engine.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_partial_defaults_are_tolerated() {
        let (engine, _sink) = engine_with(
            SimulatedHandset::new(MockMode::Instant).with_partial_settings(7),
            SimulatedPowerSupply::new(MockMode::Instant),
        );
        let report = engine.run_scenario("short").await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(!report.steps[0].success);
        assert!(report.steps[0].tolerated);
    }

    #[tokio::test]
    async fn test_run_rejects_busy_engine() {
        let (engine, _sink) = engine();
        let config = engine.context().registry.get("short").unwrap().clone();
        engine.claim(&RunPlan::full("short", &config)).unwrap();

        let result = engine.run(RunPlan::full("short", &config)).await;
        assert!(matches!(
            result,
            Err(HarnessError::EngineBusy(RunStatus::Initializing))
        ));
    }

    #[tokio::test]
    async fn test_unknown_scenario_does_not_start() {
        let (engine, _sink) = engine();
        assert!(!engine.start("nope", RunOptions::default()));
        assert_eq!(engine.status(), RunStatus::Idle);
        assert!(engine.wait().await.is_none());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
