//! Bounded retry
//!
//! One combinator, two users:
//! - the completion client retries transient service failures with backoff
//! - the correction loop retries correctable step failures without delay
//!
//! Callers supply a [`Classifier`] deciding whether an error is worth another
//! attempt and a [`RetryPolicy`] bounding the number of retries. A policy with
//! `max_retries = n` allows at most `n + 1` attempts.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    None,
    /// `delay_ms × retry_number`
    Linear { delay_ms: u64 },
    /// `initial_ms × 2^(retry_number - 1)`, capped at `max_ms`
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay before the given retry (1-based)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { delay_ms } => {
                Duration::from_millis(delay_ms.saturating_mul(u64::from(retry)))
            }
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear { delay_ms: 1_000 }
    }
}

/// Retry budget and delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay schedule
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Linear backoff: `delay_ms × retry_number`
    #[inline]
    #[must_use]
    pub fn linear(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Linear { delay_ms },
        }
    }

    /// Exponential backoff capped at `max_ms`
    #[inline]
    #[must_use]
    pub fn exponential(max_retries: u32, initial_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { initial_ms, max_ms },
        }
    }

    /// Retry without waiting
    #[inline]
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::None,
        }
    }

    /// Upper bound on attempts (`max_retries + 1`)
    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Worth another attempt
    Retry,
    /// Retrying cannot help
    Abort,
}

/// Decides whether an error is retryable
pub trait Classifier<E> {
    /// Classify an attempt's error
    fn classify(&self, error: &E) -> Disposition;
}

impl<E, F> Classifier<E> for F
where
    F: Fn(&E) -> Disposition,
{
    fn classify(&self, error: &E) -> Disposition {
        self(error)
    }
}

/// Why the retrier stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    /// Budget spent on retryable errors
    Exhausted,
    /// Classifier refused to retry
    Aborted,
}

/// Next step after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then start another attempt
    RetryAfter(Duration),
    /// Stop retrying
    GiveUp(GiveUp),
}

/// Stateful retry driver
///
/// Used directly by callers that must keep mutable state between attempts
/// (the correction loop), and wrapped by [`retry`] for closure-based callers.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    attempts: u32,
}

impl Retrier {
    /// Create a fresh driver
    #[inline]
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Register a new attempt and return its 1-based number
    ///
    /// Returns `None` once the budget is spent.
    pub fn start_attempt(&mut self) -> Option<u32> {
        if self.attempts >= self.policy.max_attempts() {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Attempts started so far
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt may start
    #[inline]
    #[must_use]
    pub fn has_budget(&self) -> bool {
        self.attempts < self.policy.max_attempts()
    }

    /// Decide what follows a failed attempt
    pub fn on_failure<E, C>(&self, error: &E, classifier: &C) -> RetryDecision
    where
        C: Classifier<E> + ?Sized,
    {
        match classifier.classify(error) {
            Disposition::Abort => RetryDecision::GiveUp(GiveUp::Aborted),
            Disposition::Retry if !self.has_budget() => RetryDecision::GiveUp(GiveUp::Exhausted),
            Disposition::Retry => {
                RetryDecision::RetryAfter(self.policy.backoff.delay(self.attempts))
            }
        }
    }
}

/// Successful result with the attempt count it took
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal failure of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryError<E> {
    /// Error of the final attempt
    pub error: E,
    /// Attempts made
    pub attempts: u32,
    /// Why retrying stopped
    pub reason: GiveUp,
}

impl<E> RetryError<E> {
    /// Whether the budget ran out (as opposed to an abort)
    #[inline]
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.reason == GiveUp::Exhausted
    }
}

/// Run `op` until it succeeds, the classifier aborts, or the budget is spent.
///
/// `op` receives the 1-based attempt number. Backoff delays suspend the
/// calling task; attempts never overlap.
pub async fn retry<T, E, C, F, Fut>(
    policy: RetryPolicy,
    classifier: C,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    C: Classifier<E>,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retrier = Retrier::new(policy);
    // max_attempts() >= 1, so the first attempt always starts
    let mut attempt = retrier.start_attempt().unwrap_or(1);
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(error) => match retrier.on_failure(&error, &classifier) {
                RetryDecision::RetryAfter(delay) => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::debug!(attempt, delay_ms, "retrying after failure");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match retrier.start_attempt() {
                        Some(next) => attempt = next,
                        None => {
                            return Err(RetryError {
                                error,
                                attempts: attempt,
                                reason: GiveUp::Exhausted,
                            })
                        }
                    }
                }
                RetryDecision::GiveUp(reason) => {
                    return Err(RetryError {
                        error,
                        attempts: attempt,
                        reason,
                    })
                }
            },
        }
    }
}
