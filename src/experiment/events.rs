//! Progress and log events.
//!
//! The engine publishes [`EngineEvent`]s on a tokio broadcast channel.
//! Sending never blocks; slow subscribers lag and lose the oldest events
//! rather than stall the sequencer.

use tokio::sync::broadcast;
use tracing::Level;

use crate::experiment::state::{RunStatus, StepRecord};

/// Buffered events per subscriber.
pub const EVENT_CAPACITY: usize = 256;

/// Event published by the run engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Operator-facing log line
    Log {
        /// Severity
        level: Level,
        /// Text
        message: String,
    },
    /// Emitted after every step
    Progress {
        /// 0-100
        percent: f64,
        /// Short description of the step just finished
        status_text: String,
        /// Steps finished so far
        step_index: usize,
        /// Steps in the plan
        total_steps: usize,
    },
    /// A step finished
    StepCompleted(StepRecord),
    /// Lifecycle transition
    StatusChanged(RunStatus),
    /// The run reached a terminal state
    RunFinished {
        /// Terminal status
        status: RunStatus,
        /// Summary
        message: String,
    },
}

/// Fire-and-forget publisher for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    /// Sink buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event.
    pub fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Publish a log line. The line is also traced at the same level.
    pub fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        match level {
            Level::ERROR => tracing::error!("{message}"),
            Level::WARN => tracing::warn!("{message}"),
            Level::INFO => tracing::info!("{message}"),
            Level::DEBUG => tracing::debug!("{message}"),
            _ => tracing::trace!("{message}"),
        }
        self.emit(EngineEvent::Log { level, message });
    }

    /// Publish progress after `finished` of `total` steps.
    pub fn progress(&self, finished: usize, total: usize, status_text: impl Into<String>) {
        let percent = if total == 0 {
            100.0
        } else {
            finished as f64 * 100.0 / total as f64
        };
        self.emit(EngineEvent::Progress {
            percent,
            status_text: status_text.into(),
            step_index: finished,
            total_steps: total,
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let sink = EventSink::default();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();

        sink.progress(3, 12, "init_hvpm");

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                EngineEvent::Progress {
                    percent,
                    step_index,
                    total_steps,
                    ..
                } => {
                    assert_eq!(step_index, 3);
                    assert_eq!(total_steps, 12);
                    assert!((percent - 25.0).abs() < 1e-9);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers_does_not_block() {
        let sink = EventSink::new(1);
        for i in 0..10 {
            sink.log(Level::INFO, format!("line {i}"));
        }
    }

    #[traced_test]
    #[test]
    fn test_log_lines_are_also_traced() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.log(Level::WARN, "rail VBAT drifted");

        assert!(logs_contain("rail VBAT drifted"));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::Log { level: Level::WARN, .. })
        ));
    }
}
