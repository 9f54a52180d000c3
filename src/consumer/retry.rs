//! Retry and timeout policy engine for handler invocations

use crate::consumer::error::ConsumerError;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on configured retries
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Upper bound on any configured delay
const MAX_BACKOFF: Duration = Duration::from_secs(3600);
/// Upper bound on the exponential base
const MAX_MULTIPLIER: f64 = 100.0;

/// Default ceiling for a single handler attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

fn out_of_range<E: serde::de::Error>(field: &str, value: impl fmt::Debug, limit: impl fmt::Debug) -> E {
    E::custom(format!("{} {:?} is outside the allowed range (max {:?})", field, value, limit))
}

fn bounded_retries<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(out_of_range("max_retries", value, MAX_RETRY_ATTEMPTS));
    }
    Ok(value)
}

fn bounded_delay<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let value = Duration::deserialize(deserializer)?;
    if value > MAX_BACKOFF {
        return Err(out_of_range("backoff", value, MAX_BACKOFF));
    }
    Ok(value)
}

fn bounded_multiplier<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !(0.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(out_of_range("backoff_multiplier", value, MAX_MULTIPLIER));
    }
    Ok(value)
}

fn bounded_jitter<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(out_of_range("jitter_factor", value, 1.0));
    }
    Ok(value)
}

/// Shape of the delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `initial_backoff`
    Fixed,
    /// `initial_backoff` for the first retry, `max_backoff` afterwards
    Stepped,
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`
    Exponential,
}

/// Retry policy configuration with validated bounds
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    #[serde(deserialize_with = "bounded_retries")]
    pub max_retries: u32,
    /// Initial backoff duration
    #[serde(deserialize_with = "bounded_delay")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration, also the later delay of a stepped schedule
    #[serde(deserialize_with = "bounded_delay")]
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential)
    #[serde(deserialize_with = "bounded_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(deserialize_with = "bounded_jitter")]
    pub jitter_factor: f64,
    /// Delay schedule
    pub strategy: BackoffStrategy,
    /// Whether a timed out attempt consumes the retry budget or fails immediately
    #[serde(default = "default_retry_timeouts")]
    pub retry_timeouts: bool,
}

fn default_retry_timeouts() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::stepped(3, Duration::from_millis(500), Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Calculate the backoff before retry number `attempt` (1-based)
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_backoff = match self.strategy {
            BackoffStrategy::Fixed => self.initial_backoff,
            BackoffStrategy::Stepped if attempt == 1 => self.initial_backoff,
            BackoffStrategy::Stepped => self.max_backoff,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let factor = self.backoff_multiplier.powi(exponent);
                let secs = self.initial_backoff.as_secs_f64() * factor;
                // Overflowing or non-finite growth saturates at the cap
                if secs.is_finite() && secs < self.max_backoff.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    self.max_backoff
                }
            }
        };

        let capped_backoff = base_backoff.min(self.max_backoff);

        if self.jitter_factor == 0.0 {
            return capped_backoff;
        }

        let jitter = capped_backoff.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        let with_jitter = Duration::from_secs_f64(capped_backoff.as_secs_f64() + jitter);

        debug!(
            "Calculated backoff for attempt {}: {:?} (base: {:?})",
            attempt, with_jitter, base_backoff
        );

        with_jitter
    }

    /// Check if we should retry after `retries_done` retries
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Same schedule with a different retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.min(MAX_RETRY_ATTEMPTS);
        self
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed backoff
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            strategy: BackoffStrategy::Fixed,
            retry_timeouts: true,
        }
    }

    /// Short delay for the first retry, longer delay for every later one
    pub fn stepped(max_retries: u32, first: Duration, subsequent: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: first,
            max_backoff: subsequent,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            strategy: BackoffStrategy::Stepped,
            retry_timeouts: true,
        }
    }

    /// Create a policy with exponential backoff
    pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: initial,
            max_backoff: max,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            strategy: BackoffStrategy::Exponential,
            retry_timeouts: true,
        }
    }
}

/// Final result of running a handler under the policy
pub enum ProcessingOutcome {
    /// Handler completed
    Success {
        /// Attempts made, including the successful one
        attempts: u32,
    },
    /// Every allowed attempt failed; the last error is kept
    Failed {
        /// Error from the last attempt
        error: anyhow::Error,
        /// Attempts made
        attempts: u32,
    },
    /// The last attempt exceeded the timeout ceiling
    TimedOut {
        /// Ceiling that was exceeded
        timeout: Duration,
        /// Attempts made
        attempts: u32,
    },
    /// Cancellation was observed; nothing may be committed or dead-lettered
    Cancelled,
}

impl ProcessingOutcome {
    /// Whether the handler completed
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success { .. })
    }

    /// Whether the message should go to the dead-letter topic
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            ProcessingOutcome::Failed { .. } | ProcessingOutcome::TimedOut { .. }
        )
    }

    /// Attempts made, zero when cancelled
    pub fn attempts(&self) -> u32 {
        match self {
            ProcessingOutcome::Success { attempts }
            | ProcessingOutcome::Failed { attempts, .. }
            | ProcessingOutcome::TimedOut { attempts, .. } => *attempts,
            ProcessingOutcome::Cancelled => 0,
        }
    }

    /// Human readable failure reason for logs and dead-letter metadata
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ProcessingOutcome::Failed { error, .. } => Some(format!("{:#}", error)),
            ProcessingOutcome::TimedOut { timeout, .. } => {
                Some(ConsumerError::TimedOut(*timeout).to_string())
            }
            _ => None,
        }
    }
}

impl fmt::Debug for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingOutcome::Success { attempts } => {
                write!(f, "Success {{ attempts: {} }}", attempts)
            }
            ProcessingOutcome::Failed { error, attempts } => {
                write!(f, "Failed {{ error: {:#}, attempts: {} }}", error, attempts)
            }
            ProcessingOutcome::TimedOut { timeout, attempts } => {
                write!(f, "TimedOut {{ timeout: {:?}, attempts: {} }}", timeout, attempts)
            }
            ProcessingOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

enum AttemptFailure {
    Error(anyhow::Error),
    TimedOut,
}

/// Runs an operation under the retry policy and a per-attempt timeout
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    timeout: Duration,
}

impl RetryExecutor {
    /// Create a new retry executor with the default attempt timeout
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Override the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Per-attempt timeout in use
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `operation` until it succeeds, the budget is spent or `cancel` fires.
    ///
    /// Cancellation is never retried and is reported as [`ProcessingOutcome::Cancelled`],
    /// including when the operation fails after the signal was raised.
    pub async fn execute<F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> ProcessingOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut retries = 0;

        loop {
            if cancel.is_cancelled() {
                return ProcessingOutcome::Cancelled;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProcessingOutcome::Cancelled,
                result = tokio::time::timeout(self.timeout, operation()) => result,
            };

            let failure = match result {
                Ok(Ok(())) => {
                    if retries > 0 {
                        debug!("Operation succeeded after {} retries", retries);
                    }
                    return ProcessingOutcome::Success { attempts: retries + 1 };
                }
                Ok(Err(_)) if cancel.is_cancelled() => return ProcessingOutcome::Cancelled,
                Ok(Err(error)) => AttemptFailure::Error(error),
                Err(_) => AttemptFailure::TimedOut,
            };

            let retryable = match failure {
                AttemptFailure::Error(_) => true,
                AttemptFailure::TimedOut => self.policy.retry_timeouts,
            };

            if !retryable || !self.policy.should_retry(retries) {
                let attempts = retries + 1;
                return match failure {
                    AttemptFailure::Error(error) => {
                        warn!("Operation failed after {} attempts: {:#}", attempts, error);
                        ProcessingOutcome::Failed { error, attempts }
                    }
                    AttemptFailure::TimedOut => {
                        warn!(
                            "Operation timed out after {:?} on attempt {}",
                            self.timeout, attempts
                        );
                        ProcessingOutcome::TimedOut {
                            timeout: self.timeout,
                            attempts,
                        }
                    }
                };
            }

            retries += 1;
            let backoff = self.policy.next_backoff(retries);

            match &failure {
                AttemptFailure::Error(error) => warn!(
                    attempt = retries,
                    delay_ms = backoff.as_millis() as u64,
                    "Retry {} after {:?} while processing message: {:#}",
                    retries,
                    backoff,
                    error
                ),
                AttemptFailure::TimedOut => warn!(
                    attempt = retries,
                    delay_ms = backoff.as_millis() as u64,
                    "Retry {} after {:?} while processing message: timed out after {:?}",
                    retries,
                    backoff,
                    self.timeout
                ),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProcessingOutcome::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        // First attempt has no backoff
        assert_eq!(policy.next_backoff(0), Duration::ZERO);

        // Subsequent attempts have exponential backoff
        let backoff1 = policy.next_backoff(1);
        assert!(backoff1 >= Duration::from_millis(100));
        assert!(backoff1 < Duration::from_millis(200)); // With jitter

        let backoff2 = policy.next_backoff(2);
        assert!(backoff2 >= Duration::from_millis(200));
        assert!(backoff2 < Duration::from_millis(400)); // With jitter
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.next_backoff(0), Duration::ZERO);
        assert_eq!(policy.next_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(2), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(3), Duration::from_millis(500));
    }

    #[test]
    fn test_stepped_backoff() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(2), Duration::from_secs(2));
        assert_eq!(policy.next_backoff(3), Duration::from_secs(2));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3)); // max_retries is 3
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_executor_recovers() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(10)));
        let count = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute(&CancellationToken::new(), || {
                let count = count.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("temporary error")
                    }
                    Ok(())
                }
            })
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_executor_exhausts_budget() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(10)));
        let count = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute(&CancellationToken::new(), || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("permanent error")
                }
            })
            .await;

        assert!(outcome.is_exhausted());
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(outcome.failure_reason().unwrap().contains("permanent error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_runs_once() {
        let executor = RetryExecutor::new(RetryPolicy::no_retry());
        let count = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute(&CancellationToken::new(), || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom")
                }
            })
            .await;

        assert!(matches!(outcome, ProcessingOutcome::Failed { attempts: 1, .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stepped_delays_between_attempts() {
        let executor = RetryExecutor::new(RetryPolicy::default().with_max_retries(2));
        let started = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));

        executor
            .execute(&CancellationToken::new(), || {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(started.elapsed());
                    anyhow::bail!("always failing")
                }
            })
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let first_gap = seen[1] - seen[0];
        let second_gap = seen[2] - seen[1];
        assert!(first_gap >= Duration::from_millis(500) && first_gap < Duration::from_millis(600));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consumes_budget() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(1, Duration::from_millis(10)))
            .with_timeout(Duration::from_millis(100));
        let count = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute(&CancellationToken::new(), || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(outcome, ProcessingOutcome::TimedOut { attempts: 2, .. }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_retry() {
        let mut policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        policy.retry_timeouts = false;
        let executor = RetryExecutor::new(policy).with_timeout(Duration::from_millis(100));

        let outcome = executor
            .execute(&CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(outcome, ProcessingOutcome::TimedOut { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_millis(10)));
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));

        let outcome = executor
            .execute(&cancel, || {
                let count = count.clone();
                let cancel = cancel.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    cancel.cancel();
                    anyhow::bail!("aborted by shutdown")
                }
            })
            .await;

        assert!(matches!(outcome, ProcessingOutcome::Cancelled));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_running_attempt() {
        let executor = RetryExecutor::new(RetryPolicy::no_retry());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = executor
            .execute(&cancel, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(outcome, ProcessingOutcome::Cancelled));
    }

    #[test]
    fn test_retry_policy_validation() {
        // Test valid configuration
        let valid_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.1,
            "strategy": "exponential"
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(valid_json);
        assert!(policy.is_ok());
        assert!(policy.unwrap().retry_timeouts);

        // Test invalid max_retries (too high)
        let invalid_retries_json = r#"
        {
            "max_retries": 10000,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.1,
            "strategy": "exponential"
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_retries_json);
        assert!(policy.is_err());

        // Test invalid backoff duration (too long)
        let invalid_duration_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 7200, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.1,
            "strategy": "stepped"
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_duration_json);
        assert!(policy.is_err());

        // Test invalid jitter factor (> 1.0)
        let invalid_jitter_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 1.5,
            "strategy": "fixed"
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_jitter_json);
        assert!(policy.is_err());
    }
}
