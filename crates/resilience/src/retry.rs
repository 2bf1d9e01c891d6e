//! Retry policy with configurable backoff
//!
//! A [`RetryPolicy`] re-executes a single logical operation until it
//! succeeds, the retry budget is spent, the error is classified as permanent,
//! or the caller cancels. Every failed attempt is recorded and the full
//! history travels with the final [`ResilienceError::RetryExhausted`].
//!
//! `max_attempts` counts retries *after* the first attempt, so an operation
//! that always fails runs `max_attempts + 1` times.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::duration_millis;
use crate::error::{
    ClassifyError, ConfigError, ConfigResult, ErrorKind, ResilienceError, ResilienceResult,
    RetryStopReason,
};

/// Spread applied by [`BackoffStrategy::ExponentialWithJitter`] (±25%)
const JITTER_RATIO: f64 = 0.25;

/// Backoff strategy for computing the delay before a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * (attempt + 1)`
    Linear,
    /// `base_delay * 2^attempt`
    Exponential,
    /// Exponential, then randomized uniformly by ±25%
    #[default]
    ExponentialWithJitter,
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-based) ignoring jitter, capped
    /// at `max_delay`.
    pub fn nominal_delay(
        self,
        attempt: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        let delay = match self {
            Self::Fixed => base_delay,
            Self::Linear => base_delay.saturating_mul(attempt.saturating_add(1)),
            Self::Exponential | Self::ExponentialWithJitter => {
                base_delay.saturating_mul(2_u32.checked_pow(attempt).unwrap_or(u32::MAX))
            }
        };
        delay.min(max_delay)
    }

    /// Delay before retry number `attempt` (0-based), jitter included
    pub fn delay(self, attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
        let delay = self.nominal_delay(attempt, base_delay, max_delay);
        match self {
            Self::ExponentialWithJitter => jitter(delay).min(max_delay),
            _ => delay,
        }
    }
}

fn jitter(delay: Duration) -> Duration {
    let spread = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
}

/// Classifies which error kinds are worth retrying
pub type RetryPredicate = Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>;

/// Validated, immutable retry options
#[derive(Clone)]
pub struct RetryOptions {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff: BackoffStrategy,
    retry_predicate: RetryPredicate,
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::ExponentialWithJitter,
            retry_predicate: Arc::new(ErrorKind::is_transient),
        }
    }
}

impl RetryOptions {
    /// Create a builder seeded with the defaults
    pub fn builder() -> RetryOptionsBuilder {
        RetryOptionsBuilder::new()
    }

    /// Retries allowed after the first attempt
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the first retry
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound on any single delay
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// How delays grow between retries
    pub const fn backoff(&self) -> BackoffStrategy {
        self.backoff
    }

    /// Whether the configured predicate retries errors of `kind`
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        (self.retry_predicate)(kind)
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt, self.base_delay, self.max_delay)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay must be greater than 0"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(format!(
                "max_delay ({:?}) must be >= base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }
}

/// Builder for [`RetryOptions`]
#[derive(Debug, Default)]
pub struct RetryOptionsBuilder {
    options: RetryOptions,
}

impl RetryOptionsBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self { options: RetryOptions::default() }
    }

    /// Set the retries after the first attempt; 0 disables retrying
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.options.max_attempts = attempts;
        self
    }

    /// Set the first delay (non-zero)
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.options.base_delay = delay;
        self
    }

    /// Set the delay cap (at least the base delay)
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.options.max_delay = delay;
        self
    }

    /// Set the backoff strategy
    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.options.backoff = strategy;
        self
    }

    /// Replace the default transient-error predicate
    pub fn retry_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.options.retry_predicate = Arc::new(predicate);
        self
    }

    /// Retry exactly the listed kinds
    pub fn retryable_kinds(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let kinds: Vec<ErrorKind> = kinds.into_iter().collect();
        self.retry_predicate(move |kind| kinds.contains(&kind))
    }

    /// Validate and build the options
    pub fn build(self) -> ConfigResult<RetryOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// One failed attempt within a retried execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Display text of the failure
    pub error: String,
    /// Classification of the failure
    pub error_kind: ErrorKind,
    /// Delay waited before this attempt started (zero for the first)
    #[serde(with = "duration_millis")]
    pub delay_before: Duration,
    /// When the attempt failed
    pub timestamp: DateTime<Utc>,
}

/// Aggregate retry statistics for one policy instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStatistics {
    /// Executions started, whatever their outcome
    pub total_executions: u64,
    /// Executions that ended in a success
    pub successful_executions: u64,
    /// Executions that ended without a success, abandoned ones included
    pub failed_executions: u64,
    /// Executions whose caller stopped waiting mid-sequence, for example
    /// because an outer timeout fired
    pub abandoned_executions: u64,
    /// Retries performed across all executions
    pub total_retry_attempts: u64,
    /// Retries-per-execution → number of executions
    pub retry_histogram: BTreeMap<u32, u64>,
    /// Failed attempts per error kind
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

impl RetryStatistics {
    /// Share of executions that eventually succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.successful_executions as f64 / self.total_executions as f64
    }
}

type ShouldRetry<'a, E> = Box<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync + 'a>;
type OnRetry<'a, E> = Box<dyn Fn(u32, &ResilienceError<E>, Duration) + Send + Sync + 'a>;

/// Per-call hooks for a retried execution.
///
/// ```rust
/// use marketplace_resilience::retry::RetryCall;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let call = RetryCall::<std::io::Error>::new()
///     .should_retry(|err| !err.is_rejection())
///     .on_retry(|attempt, err, delay| tracing::info!(attempt, %err, ?delay, "retrying"))
///     .cancel_on(token.clone());
/// # drop(call);
/// ```
pub struct RetryCall<'a, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    should_retry: Option<ShouldRetry<'a, E>>,
    on_retry: Option<OnRetry<'a, E>>,
    cancel: Option<CancellationToken>,
}

impl<E> Default for RetryCall<'_, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self { should_retry: None, on_retry: None, cancel: None }
    }
}

impl<'a, E> RetryCall<'a, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// No predicate override, no hook, no cancellation
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the policy's kind-based predicate for this call
    pub fn should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'a,
    {
        self.should_retry = Some(Box::new(predicate));
        self
    }

    /// Observe each retry: 1-based number of the failed attempt, its error,
    /// and the delay about to be waited
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(u32, &ResilienceError<E>, Duration) + Send + Sync + 'a,
    {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Abort pending delays when `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Per-target retry policy
pub struct RetryPolicy {
    name: String,
    options: RetryOptions,
    statistics: Mutex<RetryStatistics>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy named `name`
    pub fn new(name: impl Into<String>, options: RetryOptions) -> Self {
        Self { name: name.into(), options, statistics: Mutex::new(RetryStatistics::default()) }
    }

    /// Policy name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options the policy was built with
    pub const fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Execute with the policy's predicate and no hooks
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        self.execute_with(operation, RetryCall::new()).await
    }

    /// Execute with per-call predicate, retry hook and cancellation
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        mut operation: F,
        call: RetryCall<'_, E>,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        self.execute_wrapped_with(
            move || {
                let attempt = operation();
                async move { attempt.await.map_err(ResilienceError::operation) }
            },
            call,
        )
        .await
    }

    /// Execute an operation whose errors are already resilience errors
    /// (for example a bulkhead-guarded call)
    pub async fn execute_wrapped<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        self.execute_wrapped_with(operation, RetryCall::new()).await
    }

    /// Core retry loop
    #[instrument(
        skip(self, operation, call),
        fields(name = %self.name, max_attempts = self.options.max_attempts)
    )]
    pub async fn execute_wrapped_with<F, Fut, T, E>(
        &self,
        mut operation: F,
        call: RetryCall<'_, E>,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        if call.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let mut execution = ExecutionRecord::new(self);
        let mut attempt: u32 = 0;
        let mut delay_before = Duration::ZERO;
        let mut history: Vec<RetryAttemptRecord> = Vec::new();

        loop {
            execution.retries = attempt;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    execution.settle(Outcome::Succeeded);
                    return Ok(value);
                }
                Err(error) => error,
            };

            execution.error_kinds.push(error.error_kind());
            history.push(RetryAttemptRecord {
                attempt_number: attempt + 1,
                error: error.to_string(),
                error_kind: error.error_kind(),
                delay_before,
                timestamp: Utc::now(),
            });

            let retryable = call.should_retry.as_ref().map_or_else(
                || self.options.is_retryable(error.error_kind()),
                |predicate| predicate(&error),
            );
            let stop = if attempt >= self.options.max_attempts {
                Some(RetryStopReason::MaxAttemptsReached)
            } else if !retryable {
                Some(RetryStopReason::NonRetryable)
            } else if call.is_cancelled() {
                Some(RetryStopReason::Cancelled)
            } else {
                None
            };
            if let Some(reason) = stop {
                return Err(self.exhausted(execution, history, reason, error));
            }

            let delay = self.options.delay_for(attempt);
            if let Some(hook) = &call.on_retry {
                hook(attempt + 1, &error, delay);
            }
            debug!(
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Operation failed, retrying: {}",
                error
            );

            if let Some(token) = &call.cancel {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {
                        let reason = RetryStopReason::Cancelled;
                        return Err(self.exhausted(execution, history, reason, error));
                    }
                }
            } else {
                tokio::time::sleep(delay).await;
            }

            delay_before = delay;
            attempt += 1;
        }
    }

    /// Consistent snapshot of the statistics
    pub fn statistics(&self) -> RetryStatistics {
        self.statistics.lock().clone()
    }

    /// Zero every counter
    pub fn reset_statistics(&self) {
        *self.statistics.lock() = RetryStatistics::default();
        debug!(name = %self.name, "Retry statistics reset");
    }

    fn exhausted<E>(
        &self,
        execution: ExecutionRecord<'_>,
        history: Vec<RetryAttemptRecord>,
        reason: RetryStopReason,
        last_error: ResilienceError<E>,
    ) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        warn!(
            name = %self.name,
            attempts = history.len(),
            %reason,
            "Retries exhausted, last error: {}",
            last_error
        );
        execution.settle(Outcome::Failed);

        ResilienceError::RetryExhausted {
            name: self.name.clone(),
            attempts: history,
            reason,
            last_error: Box::new(last_error),
        }
    }

    fn record(&self, retries: u32, error_kinds: &[ErrorKind], outcome: Outcome) {
        let mut stats = self.statistics.lock();
        stats.total_executions += 1;
        match outcome {
            Outcome::Succeeded => stats.successful_executions += 1,
            Outcome::Failed => stats.failed_executions += 1,
            Outcome::Abandoned => {
                stats.failed_executions += 1;
                stats.abandoned_executions += 1;
            }
        }
        stats.total_retry_attempts += u64::from(retries);
        *stats.retry_histogram.entry(retries).or_insert(0) += 1;
        for kind in error_kinds {
            *stats.errors_by_kind.entry(*kind).or_insert(0) += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Succeeded,
    Failed,
    Abandoned,
}

/// Records one execution exactly once, including when the caller drops
/// the retry future mid-sequence
struct ExecutionRecord<'p> {
    policy: &'p RetryPolicy,
    retries: u32,
    error_kinds: Vec<ErrorKind>,
    settled: bool,
}

impl<'p> ExecutionRecord<'p> {
    fn new(policy: &'p RetryPolicy) -> Self {
        Self { policy, retries: 0, error_kinds: Vec::new(), settled: false }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.policy.record(self.retries, &self.error_kinds, outcome);
    }
}

impl Drop for ExecutionRecord<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(name = %self.policy.name, retries = self.retries, "Retry execution abandoned");
            self.policy.record(self.retries, &self.error_kinds, Outcome::Abandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for backoff arithmetic and the retry loop
    //!
    //! Tests cover each backoff strategy, option validation, attempt limits,
    //! predicates, hooks, cancellation and statistics.

    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn options(max_attempts: u32, strategy: BackoffStrategy) -> RetryOptions {
        RetryOptions::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .backoff(strategy)
            .build()
            .unwrap()
    }

    fn transient() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
    }

    /// Validates the nominal delay of each strategy.
    ///
    /// Assertions:
    /// - Fixed stays at the base delay.
    /// - Linear grows by one base delay per attempt.
    /// - Exponential doubles and is capped at max_delay.
    #[test]
    fn test_backoff_strategies() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);

        assert_eq!(BackoffStrategy::Fixed.delay(0, base, max), base);
        assert_eq!(BackoffStrategy::Fixed.delay(9, base, max), base);

        assert_eq!(BackoffStrategy::Linear.delay(0, base, max), Duration::from_millis(100));
        assert_eq!(BackoffStrategy::Linear.delay(2, base, max), Duration::from_millis(300));
        assert_eq!(BackoffStrategy::Linear.delay(20, base, max), max);

        assert_eq!(BackoffStrategy::Exponential.delay(0, base, max), Duration::from_millis(100));
        assert_eq!(BackoffStrategy::Exponential.delay(1, base, max), Duration::from_millis(200));
        assert_eq!(BackoffStrategy::Exponential.delay(2, base, max), Duration::from_millis(400));
        assert_eq!(BackoffStrategy::Exponential.delay(4, base, max), max);
        assert_eq!(BackoffStrategy::Exponential.delay(u32::MAX, base, max), max);
    }

    #[test]
    fn test_jitter_stays_within_spread_and_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);

        for attempt in 0..6 {
            let nominal = BackoffStrategy::ExponentialWithJitter.nominal_delay(attempt, base, max);
            for _ in 0..50 {
                let delay = BackoffStrategy::ExponentialWithJitter.delay(attempt, base, max);
                assert!(delay <= max, "Jittered delay must respect max_delay");
                assert!(delay >= nominal.mul_f64(0.75) - Duration::from_micros(1));
                assert!(delay <= nominal.mul_f64(1.25) + Duration::from_micros(1));
            }
        }
    }

    /// Tests that nominal delays stay in [base, max] and never decrease for
    /// growing strategies.
    #[test]
    fn test_nominal_delays_bounded_and_monotonic() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(900);

        for strategy in [BackoffStrategy::Linear, BackoffStrategy::Exponential] {
            let mut previous = Duration::ZERO;
            for attempt in 0..40 {
                let delay = strategy.nominal_delay(attempt, base, max);
                assert!(delay >= base && delay <= max);
                assert!(delay >= previous, "{strategy:?} must be non-decreasing");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(RetryOptions::builder().base_delay(Duration::ZERO).build().is_err());
        assert!(RetryOptions::builder()
            .base_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(RetryOptions::builder().max_attempts(0).build().is_ok());
    }

    #[test]
    fn test_retryable_kinds_override() {
        let options =
            RetryOptions::builder().retryable_kinds([ErrorKind::RateLimited]).build().unwrap();
        assert!(options.is_retryable(ErrorKind::RateLimited));
        assert!(!options.is_retryable(ErrorKind::Timeout));

        let defaults = RetryOptions::default();
        assert!(defaults.is_retryable(ErrorKind::Timeout));
        assert!(!defaults.is_retryable(ErrorKind::NotFound));
    }

    /// Tests that an always-failing operation runs `max_attempts + 1` times
    /// and the exhaustion error carries the whole history.
    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_max_attempts_plus_one() {
        let policy = RetryPolicy::new("notifications", options(3, BackoffStrategy::Fixed));
        let calls = AtomicU32::new(0);

        let result: ResilienceResult<(), io::Error> = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(ResilienceError::RetryExhausted { attempts, reason, last_error, .. }) => {
                assert_eq!(reason, RetryStopReason::MaxAttemptsReached);
                assert_eq!(attempts.len(), 4);
                assert_eq!(attempts[0].delay_before, Duration::ZERO);
                assert_eq!(attempts[1].delay_before, Duration::from_millis(100));
                assert_eq!(attempts[3].attempt_number, 4);
                assert!(matches!(*last_error, ResilienceError::OperationFailed { .. }));
            }
            other => panic!("Expected RetryExhausted, got {other:?}"),
        }

        let stats = policy.statistics();
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.total_retry_attempts, 3);
        assert_eq!(stats.retry_histogram.get(&3), Some(&1));
        assert_eq!(stats.errors_by_kind.get(&ErrorKind::Connection), Some(&4));
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new("catalog", options(5, BackoffStrategy::Fixed));
        let calls = AtomicU32::new(0);

        let result: ResilienceResult<(), io::Error> = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::new(io::ErrorKind::InvalidInput, "bad skill id"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(ResilienceError::RetryExhausted { reason, .. }) => {
                assert_eq!(reason, RetryStopReason::NonRetryable);
            }
            other => panic!("Expected RetryExhausted, got {other:?}"),
        }
    }

    /// Tests the per-call predicate and retry hook.
    ///
    /// Assertions:
    /// - The custom predicate overrides the kind-based default.
    /// - The hook sees 1-based attempt numbers and the computed delays.
    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_and_hook() {
        let policy = RetryPolicy::new("matchmaking", options(4, BackoffStrategy::Linear));
        let calls = AtomicU32::new(0);
        let observed = Mutex::new(Vec::new());

        let call = RetryCall::new()
            .should_retry(|err: &ResilienceError<io::Error>| {
                err.operation_error().is_some_and(|e| e.to_string().contains("retry me"))
            })
            .on_retry(|attempt, _err, delay| observed.lock().push((attempt, delay)));

        let result = policy
            .execute_with(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(io::Error::other("retry me"))
                    } else {
                        Ok("matched")
                    }
                },
                call,
            )
            .await;

        assert_eq!(result.unwrap(), "matched");
        assert_eq!(
            *observed.lock(),
            vec![(1, Duration::from_millis(100)), (2, Duration::from_millis(200))]
        );
        assert_eq!(policy.statistics().retry_histogram.get(&2), Some(&1));
    }

    /// Tests that cancellation aborts a pending backoff delay.
    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_delay() {
        let policy = RetryPolicy::new(
            "scheduling",
            RetryOptions::builder()
                .max_attempts(5)
                .base_delay(Duration::from_secs(60))
                .max_delay(Duration::from_secs(60))
                .backoff(BackoffStrategy::Fixed)
                .build()
                .unwrap(),
        );
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: ResilienceResult<(), io::Error> = policy
            .execute_with(|| async { Err(transient()) }, RetryCall::new().cancel_on(token))
            .await;

        assert!(started.elapsed() < Duration::from_secs(60), "Delay must be cut short");
        match result {
            Err(ResilienceError::RetryExhausted { reason, attempts, .. }) => {
                assert_eq!(reason, RetryStopReason::Cancelled);
                assert_eq!(attempts.len(), 1);
            }
            other => panic!("Expected cancelled exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_operation() {
        let policy = RetryPolicy::new("scheduling", RetryOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let result = policy
            .execute_with(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                },
                RetryCall::new().cancel_on(token),
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Validates that an execution dropped by an outer timeout still counts.
    ///
    /// Assertions:
    /// - The execution is recorded once, as failed and abandoned.
    /// - Retries and error kinds seen before the drop are kept.
    #[tokio::test(start_paused = true)]
    async fn test_dropped_execution_is_recorded_as_abandoned() {
        let policy = RetryPolicy::new("skills", options(3, BackoffStrategy::Fixed));
        let attempts = AtomicU32::new(0);

        let outcome = tokio::time::timeout(
            Duration::from_millis(150),
            policy.execute(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            }),
        )
        .await;

        assert!(outcome.is_err(), "outer timeout should fire mid-sequence");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let stats = policy.statistics();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.abandoned_executions, 1);
        assert_eq!(stats.total_retry_attempts, 1);
        assert_eq!(stats.errors_by_kind.get(&ErrorKind::Connection), Some(&2));
    }

    #[tokio::test]
    async fn test_reset_statistics() {
        let policy = RetryPolicy::new("skills", options(0, BackoffStrategy::Fixed));
        let _ = policy.execute(|| async { Ok::<_, io::Error>(()) }).await;
        let _ = policy.execute(|| async { Err::<(), _>(transient()) }).await;

        let stats = policy.statistics();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.success_rate(), 0.5);

        policy.reset_statistics();
        assert_eq!(policy.statistics(), RetryStatistics::default());
    }
}
