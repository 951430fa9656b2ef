//! Synchronized sampling.
//!
//! - `coordinator`: start event, stop flag and start deadline shared per run
//! - `pipeline`: the dedicated sampling worker and its session hand-off
//! - `decimate`: local block averaging
//! - `session`: requests, samples and the collection session
//! - `synthetic`: generator used as fallback and as the simulated DAQ

pub mod coordinator;
pub mod decimate;
pub mod pipeline;
pub mod session;
pub mod synthetic;

pub use coordinator::{sleep_cancellable, StartStopCoordinator, StopFlag};
pub use decimate::{BlockAverager, ChannelDecimator};
pub use pipeline::{CollectionOutcome, PipelineSettings, SampleSource, SamplingPipeline};
pub use session::{CollectionRequest, CollectionSession, Sample};
pub use synthetic::SyntheticAcquisition;
