//! Best-effort device commands with verification and bounded retries.
//!
//! Every device-setting step follows the same shape: issue the command,
//! confirm the device reached the desired state, retry a few times with a
//! cancellable backoff. [`verified_command`] captures that shape once; steps
//! differ only in the command and the verification predicate they pass.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::acquisition::{sleep_cancellable, StopFlag};
use crate::config::{RetryConfig, MAX_WAIT_SLICE};
use crate::error::HarnessResult;

/// Attempts and backoff for one verified command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            backoff: config.backoff,
        }
    }
}

/// Run `command` until `verify` confirms it, at most `policy.attempts` times.
///
/// Returns `Ok(true)` once verified and `Ok(false)` when every attempt failed;
/// failures are logged, not raised.
///
/// # Errors
/// `CancellationRequested` if `stop` is set between attempts.
pub async fn verified_command<C, CF, V, VF>(
    label: &str,
    policy: RetryPolicy,
    stop: &StopFlag,
    mut command: C,
    mut verify: V,
) -> HarnessResult<bool>
where
    C: FnMut() -> CF,
    CF: Future<Output = bool>,
    V: FnMut() -> VF,
    VF: Future<Output = bool>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        stop.check()?;

        if command().await {
            if verify().await {
                debug!(command = label, attempt, "Command verified");
                return Ok(true);
            }
            warn!(command = label, attempt, attempts, "Command accepted but not verified");
        } else {
            warn!(command = label, attempt, attempts, "Command rejected");
        }

        if attempt < attempts {
            sleep_cancellable(stop, policy.backoff, MAX_WAIT_SLICE).await?;
        }
    }

    warn!(command = label, attempts, "Giving up after bounded retries");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let ok = verified_command(
            "flaky",
            quick(3),
            &StopFlag::new(),
            move || async move { calls.fetch_add(1, Ordering::SeqCst) >= 1 },
            || async { true },
        )
        .await
        .unwrap();

        assert!(ok);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unverified_command_exhausts_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let ok = verified_command(
            "never_verified",
            quick(3),
            &StopFlag::new(),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            },
            || async { false },
        )
        .await
        .unwrap();

        assert!(!ok);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_aborts_retries() {
        let stop = StopFlag::new();
        stop.request();
        let result = verified_command(
            "stopped",
            quick(3),
            &stop,
            || async { true },
            || async { true },
        )
        .await;

        assert!(matches!(result, Err(HarnessError::CancellationRequested)));
    }
}
