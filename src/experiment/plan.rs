//! Executable step lists.
//!
//! A [`RunPlan`] is what the sequencer actually walks: the scenario it came
//! from, the iteration it belongs to and the ordered steps to execute.
//!
//! Iteration 1 runs the scenario's full step list. Later iterations run a
//! synthetic quick reset followed by the scenario's measurement phase only:
//!
//! ```text
//! iteration 1 : setup … stabilization │ start_sampling body stop_sampling export │ teardown
//! iteration n : quick_reset           │ start_sampling body stop_sampling export │
//! ```

use std::time::Duration;

use crate::scenario::{TestConfig, TestStep};

/// Steps to execute for one iteration of a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Registry key of the scenario
    pub scenario_key: String,
    /// The scenario definition
    pub config: TestConfig,
    /// Ordered steps of this iteration
    pub steps: Vec<TestStep>,
    /// 1-based iteration number
    pub iteration_index: u32,
    /// Iterations in the sequence
    pub iteration_count: u32,
}

impl RunPlan {
    /// Single full run of `config`.
    pub fn full(scenario_key: impl Into<String>, config: &TestConfig) -> Self {
        Self {
            scenario_key: scenario_key.into(),
            config: config.clone(),
            steps: config.steps.clone(),
            iteration_index: 1,
            iteration_count: 1,
        }
    }

    /// Plan for iteration `index` of `count`.
    ///
    /// `default_reset` is the settle time after the quick reset when the
    /// scenario does not override it.
    pub fn for_iteration(
        scenario_key: impl Into<String>,
        config: &TestConfig,
        index: u32,
        count: u32,
        default_reset: Duration,
    ) -> Self {
        let index = index.max(1);
        let steps = if index == 1 {
            config.steps.clone()
        } else {
            let settle = config.quick_reset.stabilization.unwrap_or(default_reset);
            std::iter::once(TestStep::quick_reset(settle))
                .chain(config.measurement_steps().cloned())
                .collect()
        };

        Self {
            scenario_key: scenario_key.into(),
            config: config.clone(),
            steps,
            iteration_index: index,
            iteration_count: count.max(index),
        }
    }

    /// Whether this is a reduced quick-reset iteration.
    pub fn is_quick(&self) -> bool {
        self.iteration_index > 1
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}
