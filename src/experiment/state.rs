//! Run lifecycle state.
//!
//! The engine owns exactly one [`RunState`]; everything else sees snapshots.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> Initializing ──ports ready──> Running ──all steps──> Completed
//!   ▲                                             │  │                    │
//!   │                                 critical    │  │ stop               │
//!   │                                 failure ────┘  └──> Stopped         │
//!   │                                   │                   │             │
//!   │                                   ▼                   │             │
//!   └──────────── teardown ─────────  Failed  ◄─────────────┴─────────────┘
//! ```
//!
//! Every terminal state returns to `Idle` at teardown, so the engine is
//! reusable as soon as `run` returns. The one exception is a completed
//! iteration of a repeat sequence with iterations left: it moves straight
//! back to `Initializing` for the next iteration and the engine stays busy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::results::ExportReceipt;
use crate::scenario::ActionKind;

/// Lifecycle status of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    /// Ready to start
    #[default]
    Idle,
    /// Run claimed, ports being prepared
    Initializing,
    /// Steps executing
    Running,
    /// Every step finished
    Completed,
    /// A critical step failed or a handler panicked
    Failed,
    /// Stop was requested
    Stopped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "Idle"),
            RunStatus::Initializing => write!(f, "Initializing"),
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Completed => write!(f, "Completed"),
            RunStatus::Failed => write!(f, "Failed"),
            RunStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

impl RunStatus {
    /// Whether a new run may start.
    pub fn can_start(&self) -> bool {
        matches!(self, RunStatus::Idle)
    }

    /// Whether the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    /// Whether a run currently holds the engine.
    pub fn is_busy(&self) -> bool {
        !self.can_start()
    }
}

/// Snapshot of the engine's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunState {
    /// Lifecycle status
    pub status: RunStatus,
    /// Zero-based index of the step executing (or last executed)
    pub current_step_index: usize,
    /// Steps in the running plan
    pub total_steps: usize,
    /// Whether a stop was requested for this run
    pub stop_requested: bool,
    /// Scenario being run
    pub scenario_key: Option<String>,
    /// 1-based iteration number
    pub iteration_index: u32,
    /// Iterations in the sequence
    pub iteration_count: u32,
    /// Identifier of the current run
    pub run_id: Option<String>,
}

/// One entry of the step-completion log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Zero-based position in the plan
    pub index: usize,
    /// Step name
    pub name: String,
    /// Action executed
    pub action: ActionKind,
    /// Whether the action reported success
    pub success: bool,
    /// A failure that the fault policy let through
    pub tolerated: bool,
    /// Wall time spent in the action, excluding any fixed wait
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Result of one sequencer run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier
    pub run_id: String,
    /// Scenario key
    pub scenario_key: String,
    /// 1-based iteration number
    pub iteration_index: u32,
    /// Iterations in the sequence
    pub iteration_count: u32,
    /// Terminal status
    pub status: RunStatus,
    /// Human-readable summary
    pub message: String,
    /// Name of the step that failed the run
    pub failed_step: Option<String>,
    /// Step-completion log
    pub steps: Vec<StepRecord>,
    /// Samples handed back by the pipeline
    pub samples_collected: usize,
    /// Why sampling ended early, if it did
    pub pipeline_error: Option<String>,
    /// Where the result went, if exported
    pub export: Option<ExportReceipt>,
}

impl RunReport {
    /// True for a `Completed` run.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Names of the executed steps, in order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_idle_can_start() {
        assert!(RunStatus::Idle.can_start());
        for status in [
            RunStatus::Initializing,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Stopped,
        ] {
            assert!(!status.can_start(), "{status} must not accept a start");
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Idle.is_terminal());
    }

    #[test]
    fn test_step_record_serializes_elapsed_humanly() {
        let record = StepRecord {
            index: 0,
            name: "init_hvpm".to_string(),
            action: ActionKind::SetVoltage,
            success: true,
            tolerated: false,
            elapsed: Duration::from_millis(1500),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"elapsed\":\"1s 500ms\""));
        assert!(json.contains("\"action\":\"set_voltage\""));
    }
}
