//! Exponential backoff with jitter, shared by model endpoint calls and tool calls.
//!
//! Each call site owns its own counter: a fresh [`RetryPolicy::run`] is started for
//! every endpoint round and for every individual tool invocation.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that can be fed through a [`RetryPolicy`]
pub trait Retryable: Display {
    /// Whether another attempt could plausibly succeed
    fn is_retryable(&self) -> bool {
        true
    }

    /// The error to report when a single attempt exceeds its time limit
    fn timed_out(after: Duration) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.2,
        }
    }
}

#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("failed without retry after {attempts} attempt(s): {error}")]
    Fatal { attempts: u32, error: E },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Fatal { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries, useful for tests and for calls with side effects
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt`, with `sample` in [-1, 1] selecting where in the
    /// jitter window it lands. Always within [0, max_delay].
    pub fn jittered_delay(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let sample = if sample.is_finite() {
            sample.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let nominal_secs = nominal.as_secs_f64();
        let jittered = nominal_secs + nominal_secs * self.jitter_fraction * sample;
        let clamped = jittered.clamp(0.0, self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(clamped).unwrap_or(nominal)
    }

    /// Delay before retry number `attempt` with a random jitter sample
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.jittered_delay(attempt, sample)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out of
    /// retries, or `cancel` fires. Each attempt is bounded by `timeout` when given,
    /// and a timeout counts as a retryable failure.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }
            attempts += 1;

            let attempt = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, op())
                        .await
                        .unwrap_or_else(|_| Err(E::timed_out(limit))),
                    None => op().await,
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                result = attempt => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(target: "retry", operation = label, attempts, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!(target: "retry", operation = label, attempt = attempts, error = %error, "Non-retryable failure");
                return Err(RetryError::Fatal { attempts, error });
            }

            if attempts > self.max_retries {
                warn!(target: "retry", operation = label, attempts, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted { attempts, error });
            }

            let delay = self.next_delay(attempts);
            warn!(
                target: "retry",
                operation = label,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
        TimedOut,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            !matches!(self, TestError::Broken)
        }

        fn timed_out(_after: Duration) -> Self {
            TestError::TimedOut
        }
    }

    #[test]
    fn test_nominal_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(6), Duration::from_secs(32));
        assert_eq!(policy.nominal_delay(7), Duration::from_secs(60));
        assert_eq!(policy.nominal_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_window() {
        let close = |a: Duration, b_ms: u64| a.as_millis().abs_diff(b_ms as u128) <= 1;
        let policy = RetryPolicy::default();
        assert_eq!(policy.jittered_delay(3, 0.0), Duration::from_secs(4));
        assert!(close(policy.jittered_delay(3, 1.0), 4800));
        assert!(close(policy.jittered_delay(3, -1.0), 3200));
    }

    #[test]
    fn test_delay_never_exceeds_max_or_goes_negative() {
        let policy = RetryPolicy {
            jitter_fraction: 2.5,
            ..RetryPolicy::default()
        };
        for attempt in 1..40 {
            for sample in [-1.0, -0.5, 0.0, 0.5, 1.0, f64::NAN] {
                let delay = policy.jittered_delay(attempt, sample);
                assert!(delay <= policy.max_delay);
            }
            let delay = policy.next_delay(attempt);
            assert!(delay <= policy.max_delay);
        }
        assert_eq!(policy.jittered_delay(1, -1.0), Duration::ZERO);
    }

    #[test]
    fn test_policy_deserializes_seconds() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 2, "base_delay": 0.5}"#).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.jitter_fraction, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let result = RetryPolicy::default()
            .run("flaky", None, &cancel, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Flaky)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_exceeds_max_retries_plus_one() {
        for max_retries in [0, 1, 5] {
            let policy = RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            };
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let result: Result<(), _> = policy
                .run("always-failing", None, &CancellationToken::new(), || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(TestError::Flaky)
                    }
                })
                .await;

            match result {
                Err(RetryError::Exhausted { attempts, error }) => {
                    assert_eq!(attempts, max_retries + 1);
                    assert_eq!(error, TestError::Flaky);
                }
                other => panic!("expected exhaustion, got {:?}", other),
            }
            assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_fatal_error() {
        let result: Result<(), _> = RetryPolicy::default()
            .run("broken", None, &CancellationToken::new(), || async {
                Err(TestError::Broken)
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::Fatal { attempts: 1, error: TestError::Broken })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = RetryPolicy::default()
            .run(
                "slow",
                Some(Duration::from_secs(5)),
                &CancellationToken::new(),
                || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        Ok::<_, TestError>(42)
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = RetryPolicy::default()
            .run("never", None, &cancel, || async { Ok::<(), TestError>(()) })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = policy
            .run("backing-off", None, &cancel, || async { Err(TestError::Flaky) })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }
}
