//! Scenario execution.
//!
//! - `state`: run lifecycle, step records and run reports
//! - `plan`: the step list of one iteration
//! - `context`: the collaborator ports handed to the engine
//! - `actions`: per-step dispatch
//! - `run_engine`: the step sequencer
//! - `repeat`: multi-iteration sequences
//! - `events`: progress and log events

mod actions;
pub mod context;
pub mod events;
pub mod plan;
pub mod repeat;
pub mod run_engine;
pub mod state;

pub use context::HarnessContext;
pub use events::{EngineEvent, EventSink};
pub use plan::RunPlan;
pub use repeat::{RepeatController, RepeatReport};
pub use run_engine::{RunEngine, RunOptions};
pub use state::{RunReport, RunState, RunStatus, StepRecord};
