//! Bounded exponential backoff for throttled store writes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::StoreError;

/// Errors that can tell transient throttling apart from real failures.
pub trait Throttling {
    fn is_throttled(&self) -> bool;
}

impl Throttling for StoreError {
    fn is_throttled(&self) -> bool {
        StoreError::is_throttled(self)
    }
}

/// Retry policy for throttled writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay after the first throttled attempt, before jitter.
    pub base_delay: Duration,
    /// Cap for the exponential part.
    pub max_delay: Duration,
    /// Upper bound of the uniform random jitter added to every wait.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter (deterministic waits).
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            max_jitter: Duration::ZERO,
        }
    }

    /// Exponential part of the wait after attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Full wait after attempt `attempt`: exponential part plus jitter.
    pub fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        self.delay_for_attempt(attempt).saturating_add(jitter)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError<E> {
    #[error("write still throttled after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("write cancelled")]
    Cancelled,

    #[error("write failed: {0:?}")]
    Failed(E),
}

/// Run `op` until it succeeds, fails for real, runs out of attempts, or
/// `cancel` fires.
///
/// Returns the number of attempts used on success. Only throttled errors are
/// retried; there is no wait after the final attempt.
pub async fn write_with_backoff<F, Fut, E>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<u32, WriteError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Throttling + std::fmt::Debug,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(WriteError::Cancelled);
        }

        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WriteError::Cancelled),
            outcome = op() => outcome,
        };

        match outcome {
            Ok(()) => return Ok(attempt),
            Err(err) if err.is_throttled() => {
                if !policy.should_retry(attempt) {
                    return Err(WriteError::Exhausted { attempts: attempt });
                }

                let wait = policy.wait_for_attempt(attempt);
                tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "write throttled, backing off");

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(WriteError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(err) => return Err(WriteError::Failed(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[derive(Debug, PartialEq, Eq)]
    enum FakeError {
        Throttled,
        Broken,
    }

    impl Throttling for FakeError {
        fn is_throttled(&self) -> bool {
            matches!(self, FakeError::Throttled)
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = BackoffPolicy::exponential(10, Duration::from_millis(1), Duration::from_millis(5));

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(5));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::default();
        for attempt in 1..=5 {
            let wait = policy.wait_for_attempt(attempt);
            let floor = policy.delay_for_attempt(attempt);
            assert!(wait >= floor);
            assert!(wait <= floor + policy.max_jitter);
        }
    }

    #[test]
    fn default_matches_documented_constants() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn succeeds_after_transient_throttling() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let attempts = write_with_backoff(&fast_policy(5), &cancel, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FakeError::Throttled)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = write_with_backoff(&fast_policy(5), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(FakeError::Throttled)
        })
        .await
        .unwrap_err();

        assert_eq!(err, WriteError::Exhausted { attempts: 5 });
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn real_failures_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = write_with_backoff(&fast_policy(5), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(FakeError::Broken)
        })
        .await
        .unwrap_err();

        assert_eq!(err, WriteError::Failed(FakeError::Broken));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy::exponential(5, Duration::from_secs(30), Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = write_with_backoff(&policy, &cancel, || async {
            Err::<(), _>(FakeError::Throttled)
        })
        .await
        .unwrap_err();

        assert_eq!(err, WriteError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_makes_no_attempt() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = write_with_backoff(&fast_policy(5), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), FakeError>(())
        })
        .await
        .unwrap_err();

        assert_eq!(err, WriteError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
