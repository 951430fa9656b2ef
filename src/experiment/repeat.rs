//! Repeat controller.
//!
//! Runs a scenario N times through the [`RunEngine`]. Iteration 1 is the full
//! scenario; iterations 2..N are a quick reset plus the measurement phase
//! (see [`RunPlan::for_iteration`]). A cancellable pause separates iterations.
//! The first iteration that does not complete ends the sequence.
//!
//! The engine stays claimed from the first iteration to the last, so no
//! other run can start during the pauses.

use tracing::Level;

use crate::acquisition::sleep_cancellable;
use crate::error::{HarnessError, HarnessResult};
use crate::experiment::plan::RunPlan;
use crate::experiment::run_engine::RunEngine;
use crate::experiment::state::{RunReport, RunStatus};
use crate::scenario::TestConfig;

/// Outcome of a repeat sequence.
#[derive(Debug, Clone)]
pub struct RepeatReport {
    /// Scenario key
    pub scenario_key: String,
    /// Iterations requested
    pub requested: u32,
    /// Reports of the iterations that ran, in order
    pub iterations: Vec<RunReport>,
    /// First iteration that failed
    pub failed_iteration: Option<u32>,
    /// Whether a stop ended the sequence
    pub stopped: bool,
}

impl RepeatReport {
    fn new(scenario_key: &str, requested: u32) -> Self {
        Self {
            scenario_key: scenario_key.to_string(),
            requested,
            iterations: Vec::new(),
            failed_iteration: None,
            stopped: false,
        }
    }

    /// True when every requested iteration completed.
    pub fn success(&self) -> bool {
        self.failed_iteration.is_none()
            && !self.stopped
            && self.iterations.len() == self.requested as usize
            && self.iterations.iter().all(RunReport::is_success)
    }

    /// Status of the sequence as a whole.
    pub fn status(&self) -> RunStatus {
        if self.stopped {
            RunStatus::Stopped
        } else if self.success() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }

    /// Human-readable summary.
    pub fn message(&self) -> String {
        if let Some(index) = self.failed_iteration {
            let detail = self
                .iterations
                .last()
                .map(|r| r.message.clone())
                .unwrap_or_default();
            format!(
                "'{}' failed at iteration {}/{}: {}",
                self.scenario_key, index, self.requested, detail
            )
        } else if self.stopped {
            format!(
                "'{}' stopped after {} of {} iteration(s)",
                self.scenario_key,
                self.iterations.len(),
                self.requested
            )
        } else {
            format!(
                "'{}' completed {} iteration(s)",
                self.scenario_key,
                self.iterations.len()
            )
        }
    }
}

/// Drives repeat sequences on an engine.
#[derive(Clone)]
pub struct RepeatController {
    engine: RunEngine,
}

impl RepeatController {
    /// Controller over `engine`.
    pub fn new(engine: RunEngine) -> Self {
        Self { engine }
    }

    /// Run `scenario_key` `repeat_count` times on the caller's task.
    ///
    /// # Errors
    /// - `ScenarioNotFound` for unknown keys
    /// - `Configuration` when `repeat_count` is zero
    /// - `EngineBusy` when another run holds the engine
    pub async fn run(&self, scenario_key: &str, repeat_count: u32) -> HarnessResult<RepeatReport> {
        if repeat_count == 0 {
            return Err(HarnessError::Configuration(
                "repeat count must be at least 1".to_string(),
            ));
        }
        let config = self.engine.context().registry.get(scenario_key)?.clone();
        let first = self.engine.plan(scenario_key, &config, 1, repeat_count);
        self.engine.claim(&first)?;
        self.engine.stop_flag().reset();
        Ok(self.run_claimed(config, first).await)
    }

    /// Continue a sequence whose first iteration is already claimed.
    pub(crate) async fn run_claimed(&self, config: TestConfig, first: RunPlan) -> RepeatReport {
        let engine = &self.engine;
        let events = engine.events();
        let key = first.scenario_key.clone();
        let count = first.iteration_count;
        let mut report = RepeatReport::new(&key, count);

        let mut plan = first;
        for index in 1..=count {
            if index > 1 {
                let timing = &engine.context().config.timing;
                events.log(
                    Level::INFO,
                    format!("Pausing {:?} before iteration {index}/{count}", timing.inter_iteration_pause),
                );
                if sleep_cancellable(engine.stop_flag(), timing.inter_iteration_pause, timing.wait_slice)
                    .await
                    .is_err()
                {
                    report.stopped = true;
                    engine.release();
                    break;
                }

                plan = engine.plan(&key, &config, index, count);
                engine.advance(&plan);
            }

            let run = engine.execute_claimed(plan.clone(), index < count).await;
            let status = run.status;
            report.iterations.push(run);

            match status {
                RunStatus::Completed => {}
                RunStatus::Stopped => {
                    report.stopped = true;
                    break;
                }
                _ => {
                    report.failed_iteration = Some(index);
                    break;
                }
            }
        }

        if count > 1 {
            let level = if report.success() { Level::INFO } else { Level::WARN };
            events.log(level, report.message());
        }
        report
    }
}
