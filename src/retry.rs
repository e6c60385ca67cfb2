//! Retry policy evaluation for activity and child-workflow calls.
//!
//! The evaluator is pure: given the attempt that just failed, the logical time
//! elapsed since the first attempt, and the failure, it decides whether to
//! retry and after how long. The orchestration context turns a
//! [`RetryDecision::RetryAfter`] into a durable timer followed by a new attempt.

use crate::FailureDetails;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a given failure is worth retrying.
pub type RetryHandler = Arc<dyn Fn(&FailureDetails) -> bool + Send + Sync>;

/// Retry policy attached to a single activity or child-workflow call.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves as one.
    pub max_attempts: u32,
    pub initial_retry_interval: Duration,
    /// Multiplier applied per attempt. Values below 1.0 are treated as 1.0.
    pub backoff_coefficient: f64,
    /// Upper bound for a single delay.
    pub max_retry_interval: Option<Duration>,
    /// Upper bound for the whole retry sequence, measured from the first attempt.
    pub retry_timeout: Option<Duration>,
    pub handle: Option<RetryHandler>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_retry_interval", &self.initial_retry_interval)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_retry_interval", &self.max_retry_interval)
            .field("retry_timeout", &self.retry_timeout)
            .field("handle", &self.handle.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_retry_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_retry_interval: None,
            retry_timeout: None,
            handle: None,
        }
    }
}

/// Outcome of evaluating a policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    Stop,
}

impl RetryPolicy {
    /// Policy with the given attempt budget and first delay. Like
    /// [`Default`], delays double on each attempt (coefficient 2.0); use
    /// [`with_backoff_coefficient`](Self::with_backoff_coefficient)`(1.0)` for fixed delays.
    pub fn new(max_attempts: u32, initial_retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_retry_interval,
            backoff_coefficient: 2.0,
            max_retry_interval: None,
            retry_timeout: None,
            handle: None,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_interval(mut self, max: Duration) -> Self {
        self.max_retry_interval = Some(max);
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    pub fn with_handle<F>(mut self, handle: F) -> Self
    where
        F: Fn(&FailureDetails) -> bool + Send + Sync + 'static,
    {
        self.handle = Some(Arc::new(handle));
        self
    }

    fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let coefficient = if self.backoff_coefficient.is_finite() && self.backoff_coefficient >= 1.0 {
            self.backoff_coefficient
        } else {
            1.0
        };
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_retry_interval.as_millis() as f64;
        let mut delay_ms = base_ms * coefficient.powi(exponent);
        if let Some(max) = self.max_retry_interval {
            delay_ms = delay_ms.min(max.as_millis() as f64);
        }
        if !delay_ms.is_finite() || delay_ms >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Decide what to do after `attempt` (1-based) failed with `failure`,
    /// `elapsed` after the first attempt was issued.
    pub fn evaluate(&self, attempt: u32, elapsed: Duration, failure: &FailureDetails) -> RetryDecision {
        if attempt >= self.effective_max_attempts() {
            return RetryDecision::Stop;
        }
        if failure.is_non_retriable {
            return RetryDecision::Stop;
        }
        if let Some(handle) = &self.handle
            && !handle(failure)
        {
            return RetryDecision::Stop;
        }
        let delay = self.delay_for_attempt(attempt);
        if let Some(timeout) = self.retry_timeout
            && elapsed.saturating_add(delay) > timeout
        {
            return RetryDecision::Stop;
        }
        if delay.is_zero() {
            RetryDecision::RetryNow
        } else {
            RetryDecision::RetryAfter(delay)
        }
    }
}
