//! Sampling pipeline.
//!
//! Runs one timed collection on a dedicated OS thread:
//!
//! ```text
//!  start() ──spawn──► worker: wait_for_start(deadline)
//!                           │
//!                           ▼
//!                     batch read (≤ batch) ──► decimate ──► session.push
//!                           │  ▲                              │
//!                           └──┘ until complete / finish / stop
//!                                                             │
//!  stop() ◄──────────── oneshot hand-off of CollectionOutcome ┘
//! ```
//!
//! The worker owns the session while collecting. `stop()` raises the finish
//! flag and receives the session over a oneshot channel, bounded by the join
//! timeout, so no buffer is ever shared between the two sides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::acquisition::coordinator::StartStopCoordinator;
use crate::acquisition::decimate::ChannelDecimator;
use crate::acquisition::session::{CollectionRequest, CollectionSession};
use crate::acquisition::synthetic::SyntheticAcquisition;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::hardware::{Acquisition, MockMode};

/// Where the samples came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// The configured acquisition port
    Hardware,
    /// The synthetic fallback generator
    Synthetic,
}

/// Session handed back by [`SamplingPipeline::stop`].
#[derive(Debug)]
pub struct CollectionOutcome {
    /// Collected samples, possibly fewer than expected
    pub session: CollectionSession,
    /// Source that produced them
    pub source: SampleSource,
    /// Why collection ended early, if it did
    pub error: Option<HarnessError>,
}

impl CollectionOutcome {
    fn empty(request: &CollectionRequest, source: SampleSource, error: HarnessError) -> Self {
        Self {
            session: CollectionSession::new(request),
            source,
            error: Some(error),
        }
    }

    /// True when every expected sample was collected without error.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.session.is_complete()
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Length of one blocking read
    pub batch: Duration,
    /// Bound on waiting for the worker at stop
    pub join_timeout: Duration,
    /// Whether the synthetic fallback blocks like real hardware
    pub paced_fallback: bool,
}

impl PipelineSettings {
    /// Settings from the harness configuration.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            batch: config.acquisition.batch,
            join_timeout: config.timing.join_timeout,
            paced_fallback: config.simulation.mode == MockMode::Realistic,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

struct ActiveCollection {
    request: CollectionRequest,
    source: SampleSource,
    finish: Arc<AtomicBool>,
    outcome_rx: oneshot::Receiver<CollectionOutcome>,
    handle: JoinHandle<()>,
}

/// Owner of at most one active collection.
pub struct SamplingPipeline {
    acquisition: Option<Arc<dyn Acquisition>>,
    settings: PipelineSettings,
    active: Option<ActiveCollection>,
}

impl SamplingPipeline {
    /// Pipeline over `acquisition`; `None` always uses the synthetic source.
    pub fn new(acquisition: Option<Arc<dyn Acquisition>>, settings: PipelineSettings) -> Self {
        Self {
            acquisition,
            settings,
            active: None,
        }
    }

    /// Whether a collection is running or awaiting hand-off.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the active worker has already handed off its session.
    pub fn is_finished(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.handle.is_finished())
    }

    /// Begin a collection on a dedicated worker thread.
    ///
    /// The worker waits for `coordinator`'s start signal (bounded by its
    /// start deadline) before the first read.
    ///
    /// # Errors
    /// - `SessionActive` if the previous collection was not stopped
    /// - `Configuration` for an invalid request
    /// - `Io` if the worker thread cannot be spawned
    pub fn start(
        &mut self,
        request: CollectionRequest,
        coordinator: Arc<StartStopCoordinator>,
    ) -> HarnessResult<()> {
        if self.active.is_some() {
            return Err(HarnessError::SessionActive);
        }
        request.validate()?;

        let (port, source) = self.select_port();
        let finish = Arc::new(AtomicBool::new(false));
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let worker = CollectionWorker {
            port,
            source,
            request: request.clone(),
            coordinator,
            finish: Arc::clone(&finish),
            batch: self.settings.batch,
        };

        let handle = thread::Builder::new()
            .name("sampling".to_string())
            .spawn(move || {
                let outcome = worker.run();
                // receiver gone means the pipeline was dropped; nothing to hand off to
                let _ = outcome_tx.send(outcome);
            })?;

        info!(
            channels = request.channels.len(),
            raw_rate = request.raw_rate,
            compress_ratio = request.compress_ratio,
            expected = request.expected_sample_count(),
            ?source,
            "Sampling pipeline started"
        );

        self.active = Some(ActiveCollection {
            request,
            source,
            finish,
            outcome_rx,
            handle,
        });
        Ok(())
    }

    /// Finish the active collection and take ownership of its session.
    ///
    /// Never blocks longer than the join timeout. Returns `None` when no
    /// collection was active.
    pub async fn stop(&mut self) -> Option<CollectionOutcome> {
        let mut active = self.active.take()?;
        active.finish.store(true, Ordering::SeqCst);

        let timeout = self.settings.join_timeout;
        let outcome = match tokio::time::timeout(timeout, &mut active.outcome_rx).await {
            Ok(Ok(outcome)) => {
                // the worker has already handed off and is exiting
                let handle = active.handle;
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                outcome
            }
            Ok(Err(_)) => {
                error!("Sampling worker exited without handing off its session");
                CollectionOutcome::empty(
                    &active.request,
                    active.source,
                    HarnessError::StepFailure {
                        step: "sampling".to_string(),
                        reason: "worker terminated unexpectedly".to_string(),
                    },
                )
            }
            Err(_) => {
                warn!(?timeout, "Sampling worker did not finish in time; detaching it");
                CollectionOutcome::empty(
                    &active.request,
                    active.source,
                    HarnessError::CommandTimeout {
                        operation: "sampling worker join".to_string(),
                        timeout,
                    },
                )
            }
        };

        info!(
            samples = outcome.session.len(),
            expected = outcome.session.expected_sample_count(),
            error = outcome.error.as_ref().map(|e| e.to_string()),
            "Sampling pipeline stopped"
        );
        Some(outcome)
    }

    /// Let the worker finish on its own for up to `grace`, then stop it.
    ///
    /// Used at the end of a measurement body so the in-flight batch is not
    /// cut short by scheduling jitter between the two workers.
    pub async fn drain(&mut self, grace: Duration, slice: Duration) -> Option<CollectionOutcome> {
        let deadline = Instant::now() + grace;
        while self.is_active() && !self.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(slice).await;
        }
        self.stop().await
    }

    fn select_port(&self) -> (Arc<dyn Acquisition>, SampleSource) {
        match &self.acquisition {
            Some(port) if port.is_connected() => (Arc::clone(port), SampleSource::Hardware),
            Some(_) => {
                warn!("Acquisition hardware not connected; using synthetic samples");
                (self.fallback(), SampleSource::Synthetic)
            }
            None => {
                warn!("No acquisition hardware configured; using synthetic samples");
                (self.fallback(), SampleSource::Synthetic)
            }
        }
    }

    fn fallback(&self) -> Arc<dyn Acquisition> {
        Arc::new(SyntheticAcquisition::new().paced(self.settings.paced_fallback))
    }
}

impl Drop for SamplingPipeline {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            warn!("SamplingPipeline dropped while collecting, signalling worker to finish");
            active.finish.store(true, Ordering::SeqCst);
        }
    }
}

struct CollectionWorker {
    port: Arc<dyn Acquisition>,
    source: SampleSource,
    request: CollectionRequest,
    coordinator: Arc<StartStopCoordinator>,
    finish: Arc<AtomicBool>,
    batch: Duration,
}

impl CollectionWorker {
    fn run(self) -> CollectionOutcome {
        let mut session = CollectionSession::new(&self.request);

        let deadline = self.coordinator.start_deadline();
        let finish = Arc::clone(&self.finish);
        let started = match self
            .coordinator
            .wait_for_start_or(deadline, move || finish.load(Ordering::SeqCst))
        {
            Ok(at) => at,
            Err(e) => {
                warn!(error = %e, "Collection aborted before the measurement started");
                return self.outcome(session, Some(e));
            }
        };
        debug!(delay = ?started.elapsed(), "Start signal observed by sampling worker");

        let error = self.collect(&mut session);

        info!(
            samples = session.len(),
            expected = session.expected_sample_count(),
            elapsed = ?started.elapsed(),
            "Collection finished"
        );
        self.outcome(session, error)
    }

    fn collect(&self, session: &mut CollectionSession) -> Option<HarnessError> {
        let request = &self.request;
        let output_rate = request.output_rate();
        let native = self.port.supports_block_averaging() && request.compress_ratio > 1;
        let mut decimator = ChannelDecimator::new(&request.channels, request.compress_ratio);
        let per_batch = ((self.batch.as_secs_f64() * output_rate).round() as usize).max(1);

        while !session.is_complete() {
            if self.finish.load(Ordering::SeqCst) {
                debug!(samples = session.len(), "Finish requested, ending collection");
                return None;
            }
            if self.coordinator.is_stop_requested() {
                return Some(HarnessError::CancellationRequested);
            }

            let outputs = per_batch.min(session.remaining());
            let duration = Duration::from_secs_f64(outputs as f64 / output_rate);

            let read = if native {
                self.port.read_channels_hardware_timed(
                    &request.channels,
                    request.raw_rate,
                    request.compress_ratio,
                    duration,
                )
            } else {
                self.port
                    .read_channels_hardware_timed(&request.channels, request.raw_rate, 1, duration)
                    .map(|raw| decimator.feed(&raw))
            };

            let series = match read {
                Ok(series) => series,
                Err(e) => {
                    error!(error = %e, samples = session.len(), "Acquisition read failed");
                    return Some(e);
                }
            };

            let rows = request
                .channels
                .iter()
                .map(|ch| series.get(ch).map_or(0, Vec::len))
                .min()
                .unwrap_or(0);
            if rows == 0 {
                return Some(HarnessError::unavailable(
                    crate::error::Port::Acquisition,
                    "read returned no samples",
                ));
            }

            for row in 0..rows {
                let values = request
                    .channels
                    .iter()
                    .filter_map(|ch| series.get(ch).map(|v| (ch.clone(), v[row])))
                    .collect();
                if !session.push(values) {
                    break;
                }
            }
        }
        None
    }

    fn outcome(&self, session: CollectionSession, error: Option<HarnessError>) -> CollectionOutcome {
        CollectionOutcome {
            session,
            source: self.source,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::coordinator::StopFlag;
    use crate::hardware::ChannelId;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            batch: Duration::from_millis(500),
            join_timeout: Duration::from_secs(2),
            paced_fallback: false,
        }
    }

    fn request(duration: Duration) -> CollectionRequest {
        CollectionRequest {
            channels: vec![ChannelId::from("ai0"), ChannelId::from("ai1")],
            raw_rate: 30_000.0,
            compress_ratio: 30,
            duration,
        }
    }

    fn coordinator(deadline: Duration) -> Arc<StartStopCoordinator> {
        Arc::new(StartStopCoordinator::new(
            StopFlag::new(),
            deadline,
            Duration::from_millis(20),
        ))
    }

    async fn wait_until_finished(pipeline: &SamplingPipeline) {
        let begin = Instant::now();
        while !pipeline.is_finished() && begin.elapsed() < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_local_decimation_yields_exact_count() {
        let port = Arc::new(SyntheticAcquisition::new());
        let mut pipeline = SamplingPipeline::new(Some(port.clone()), settings());
        let coord = coordinator(Duration::from_secs(5));

        pipeline
            .start(request(Duration::from_secs(10)), Arc::clone(&coord))
            .unwrap();
        coord.signal_start();
        wait_until_finished(&pipeline).await;

        let outcome = pipeline.stop().await.unwrap();
        assert!(outcome.is_complete(), "{:?}", outcome.error);
        assert_eq!(outcome.source, SampleSource::Hardware);
        assert_eq!(outcome.session.len(), 10_000);
        for (i, sample) in outcome.session.samples().iter().enumerate() {
            assert_eq!(sample.elapsed_index, i);
            assert_eq!(sample.values.len(), 2);
        }
        // 10 s in 500 ms batches
        assert_eq!(port.reads(), 20);
    }

    #[tokio::test]
    async fn test_native_averaging_is_used_when_offered() {
        let port = Arc::new(SyntheticAcquisition::new().with_native_averaging(true));
        let mut pipeline = SamplingPipeline::new(Some(port.clone()), settings());
        let coord = coordinator(Duration::from_secs(5));

        pipeline
            .start(request(Duration::from_secs(2)), Arc::clone(&coord))
            .unwrap();
        coord.signal_start();
        wait_until_finished(&pipeline).await;

        let outcome = pipeline.stop().await.unwrap();
        assert_eq!(outcome.session.len(), 2_000);
        assert!(outcome.is_complete());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let mut pipeline = SamplingPipeline::new(None, settings());
        let coord = coordinator(Duration::from_secs(5));

        pipeline
            .start(request(Duration::from_secs(1)), Arc::clone(&coord))
            .unwrap();
        let second = pipeline.start(request(Duration::from_secs(1)), Arc::clone(&coord));
        assert!(matches!(second, Err(HarnessError::SessionActive)));

        coord.signal_start();
        let outcome = pipeline.stop().await.unwrap();
        assert!(!pipeline.is_active());
        assert!(outcome.session.len() <= 1_000);
    }

    #[tokio::test]
    async fn test_missing_start_signal_times_out_with_empty_session() {
        let mut pipeline = SamplingPipeline::new(None, settings());
        let coord = coordinator(Duration::from_millis(300));

        pipeline
            .start(request(Duration::from_secs(1)), Arc::clone(&coord))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let outcome = pipeline.stop().await.unwrap();
        assert!(outcome.session.is_empty());
        assert!(matches!(
            outcome.error,
            Some(HarnessError::SynchronizationTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnected_port_falls_back_to_synthetic() {
        let port = Arc::new(SyntheticAcquisition::new());
        port.set_connected(false);
        let mut pipeline = SamplingPipeline::new(Some(port.clone()), settings());
        let coord = coordinator(Duration::from_secs(5));

        pipeline
            .start(request(Duration::from_secs(1)), Arc::clone(&coord))
            .unwrap();
        coord.signal_start();
        wait_until_finished(&pipeline).await;

        let outcome = pipeline.stop().await.unwrap();
        assert_eq!(outcome.source, SampleSource::Synthetic);
        assert_eq!(outcome.session.len(), 1_000);
        assert_eq!(port.reads(), 0);
    }

    #[tokio::test]
    async fn test_read_failure_keeps_partial_session() {
        let port = Arc::new(SyntheticAcquisition::new().failing_after(2));
        let mut pipeline = SamplingPipeline::new(Some(port), settings());
        let coord = coordinator(Duration::from_secs(5));

        pipeline
            .start(request(Duration::from_secs(5)), Arc::clone(&coord))
            .unwrap();
        coord.signal_start();
        wait_until_finished(&pipeline).await;

        let outcome = pipeline.stop().await.unwrap();
        assert_eq!(outcome.session.len(), 1_000);
        assert!(matches!(
            outcome.error,
            Some(HarnessError::ConnectionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_early_stop_of_paced_collection_is_bounded() {
        let port = Arc::new(SyntheticAcquisition::new().paced(true));
        let mut pipeline = SamplingPipeline::new(Some(port), settings());
        let coord = coordinator(Duration::from_secs(5));

        pipeline
            .start(request(Duration::from_secs(30)), Arc::clone(&coord))
            .unwrap();
        coord.signal_start();
        tokio::time::sleep(Duration::from_millis(700)).await;

        let begin = Instant::now();
        let outcome = pipeline.stop().await.unwrap();
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert!(outcome.error.is_none());
        assert!(!outcome.session.is_empty());
        assert!(outcome.session.len() < 30_000);
    }
}
