//! Bounded retry on artifact conflicts.
//!
//! The whole reconcile body is the retried unit: after a conflict the next
//! attempt re-reads the artifact and merges again on top of whatever the
//! winning writer stored.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::ReconcileError;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Extra random delay, as a fraction of the current delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts, ..Default::default() }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(0.0..self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Run `operation` until it succeeds, fails with anything but a conflict,
/// or `max_attempts` is spent. The closure receives the 1-based attempt.
///
/// Cancellation is checked before every attempt and while backing off.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, ReconcileError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ReconcileError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_conflict() => e,
            Err(e) => return Err(e),
        };
        counter!("reconcile_conflict_retries", 1u64);

        if attempt >= max_attempts {
            error!(operation = %operation_name, attempt, error = %err, "giving up after repeated conflicts");
            return Err(match err {
                ReconcileError::ArtifactConflict { artifact, .. } => ReconcileError::ArtifactConflict { artifact, attempts: attempt },
                other => other,
            });
        }

        let wait = config.jittered(delay);
        warn!(operation = %operation_name, attempt, delay_ms = wait.as_millis() as u64, "artifact conflict, retrying");
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        delay = Duration::from_secs_f64((delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> ReconcileError {
        ReconcileError::ArtifactConflict { artifact: "ns/cm".into(), attempts: 1 }
    }

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig { max_attempts: attempts, initial_delay: Duration::from_millis(1), jitter: 0.0, ..Default::default() }
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let res = retry_on_conflict(&fast(5), "op", &CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 3 { Err(conflict()) } else { Ok(attempt) } }
        })
        .await;
        assert_eq!(res.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bound_is_honored() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry_on_conflict(&fast(4), "op", &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(matches!(res, Err(ReconcileError::ArtifactConflict { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry_on_conflict(&fast(5), "op", &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ReconcileError::Cancelled) }
        })
        .await;
        assert!(matches!(res, Err(ReconcileError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryConfig { max_attempts: 10, initial_delay: Duration::from_secs(60), jitter: 0.0, ..Default::default() };
        let c = cancel.clone();
        let res: Result<(), _> = retry_on_conflict(&slow, "op", &cancel, move |_| {
            c.cancel();
            async { Err(conflict()) }
        })
        .await;
        assert!(matches!(res, Err(ReconcileError::Cancelled)));
    }
}
