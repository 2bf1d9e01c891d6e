//! Circuit breaker for outbound calls to a single logical target
//!
//! The breaker tracks failures of the calls it wraps and stops sending traffic
//! to a failing dependency for a cooldown period.
//!
//! ```text
//! Closed ──(trip condition)──▶ Open ──(break_duration elapsed)──▶ HalfOpen
//!   ▲                           ▲                                    │
//!   └───────(probe succeeds)────┼────────────────────────────────────┤
//!                               └──────────(probe fails)─────────────┘
//! ```
//!
//! While half-open exactly one probe call is admitted; every other call is
//! rejected as if the breaker were still open. All state and counters live
//! behind one mutex per breaker, so a statistics snapshot is never torn.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::duration_millis;
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Number of response-time samples kept per breaker
const RESPONSE_WINDOW: usize = 100;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the break duration elapses
    Open,
    /// A single probe call is testing whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Validated, immutable circuit breaker options
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerOptions {
    consecutive_failure_limit: u32,
    failure_rate_threshold: f64,
    minimum_throughput: u64,
    break_duration: Duration,
    per_call_timeout: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            consecutive_failure_limit: 5,
            failure_rate_threshold: 0.5,
            minimum_throughput: 20,
            break_duration: Duration::from_secs(30),
            per_call_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerOptions {
    /// Create a builder seeded with the defaults
    pub fn builder() -> CircuitBreakerOptionsBuilder {
        CircuitBreakerOptionsBuilder::new()
    }

    /// Consecutive failures that trip the breaker
    pub const fn consecutive_failure_limit(&self) -> u32 {
        self.consecutive_failure_limit
    }

    /// Failure ratio that trips the breaker once `minimum_throughput` is met
    pub const fn failure_rate_threshold(&self) -> f64 {
        self.failure_rate_threshold
    }

    /// Calls required before the failure ratio is considered
    pub const fn minimum_throughput(&self) -> u64 {
        self.minimum_throughput
    }

    /// Cooldown before a half-open probe is allowed
    pub const fn break_duration(&self) -> Duration {
        self.break_duration
    }

    /// Longest an admitted operation may run
    pub const fn per_call_timeout(&self) -> Duration {
        self.per_call_timeout
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.consecutive_failure_limit == 0 {
            return Err(ConfigError::invalid("consecutive_failure_limit must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(ConfigError::invalid(format!(
                "failure_rate_threshold must be within [0, 1], got {}",
                self.failure_rate_threshold
            )));
        }
        if self.break_duration.is_zero() {
            return Err(ConfigError::invalid("break_duration must be greater than 0"));
        }
        if self.per_call_timeout.is_zero() {
            return Err(ConfigError::invalid("per_call_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerOptions`]
#[derive(Debug)]
pub struct CircuitBreakerOptionsBuilder {
    options: CircuitBreakerOptions,
}

impl Default for CircuitBreakerOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerOptionsBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self { options: CircuitBreakerOptions::default() }
    }

    /// Set the consecutive failures that trip the breaker (at least 1)
    pub fn consecutive_failure_limit(mut self, limit: u32) -> Self {
        self.options.consecutive_failure_limit = limit;
        self
    }

    /// Set the failure ratio that trips the breaker, within `[0, 1]`
    pub fn failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.options.failure_rate_threshold = threshold;
        self
    }

    /// Set the calls required before the failure ratio applies
    pub fn minimum_throughput(mut self, throughput: u64) -> Self {
        self.options.minimum_throughput = throughput;
        self
    }

    /// Set the cooldown before a half-open probe (non-zero)
    pub fn break_duration(mut self, duration: Duration) -> Self {
        self.options.break_duration = duration;
        self
    }

    /// Set the longest an admitted operation may run (non-zero)
    pub fn per_call_timeout(mut self, timeout: Duration) -> Self {
        self.options.per_call_timeout = timeout;
        self
    }

    /// Validate and build the options
    pub fn build(self) -> ConfigResult<CircuitBreakerOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Consistent snapshot of a breaker's state and counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    /// Breaker name
    pub name: String,
    /// State at the time of the snapshot
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successful calls since the last statistics reset
    pub success_count: u64,
    /// Failed calls, timeouts included, since the last statistics reset
    pub failure_count: u64,
    /// Automatic Closed to Open transitions
    pub trip_count: u64,
    /// Calls refused while open or while the probe slot was taken
    pub rejected_count: u64,
    /// When the last failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker last opened
    pub last_opened_at: Option<DateTime<Utc>>,
    /// Message of the last failure
    pub last_error: Option<String>,
    /// Mean over the rolling window of successful response times
    #[serde(with = "duration_millis")]
    pub average_response_time: Duration,
    /// Slowest response in the rolling window
    #[serde(with = "duration_millis")]
    pub max_response_time: Duration,
    /// Samples currently in the rolling window
    pub response_samples: usize,
}

impl CircuitBreakerStatistics {
    /// Share of recorded calls that failed (0.0 when nothing was recorded)
    pub fn failure_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.failure_count as f64 / total as f64
    }
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    trip_count: u64,
    rejected_count: u64,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
    last_opened_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    response_times: VecDeque<Duration>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            success_count: 0,
            failure_count: 0,
            trip_count: 0,
            rejected_count: 0,
            probe_in_flight: false,
            opened_at: None,
            last_opened_at: None,
            last_failure_at: None,
            last_error: None,
            response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }

    fn cooldown_elapsed(&self, now: Instant, break_duration: Duration) -> bool {
        self.opened_at
            .map_or(true, |opened| now.saturating_duration_since(opened) >= break_duration)
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }
}

/// Per-target circuit breaker.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker for `name` using the system clock
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self::with_clock(name, options, Arc::new(SystemClock))
    }

    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        options: CircuitBreakerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { name: name.into(), options, state: Mutex::new(BreakerState::new()), clock }
    }

    /// Logical target name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options this breaker was built with
    pub const fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call made now would be admitted, without changing state
    pub fn is_call_permitted(&self) -> bool {
        let state = self.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                state.cooldown_elapsed(self.clock.now(), self.options.break_duration)
            }
            CircuitState::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Execute an operation under breaker protection.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without invoking `operation`
    /// when the breaker is open, [`ResilienceError::Timeout`] when the
    /// operation overruns the per-call timeout, and
    /// [`ResilienceError::OperationFailed`] for the operation's own errors.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute_wrapped(move || async move {
            operation().await.map_err(ResilienceError::operation)
        })
        .await
    }

    /// Like [`execute`](Self::execute), but routes a rejection to `fallback`.
    ///
    /// The fallback receives the rejection error and only runs when the
    /// operation was never invoked; the operation's own failures propagate.
    pub async fn execute_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.execute(operation).await {
            Err(rejection @ ResilienceError::CircuitOpen { .. }) => {
                debug!(policy = "circuit_breaker", name = %self.name, "Invoking fallback");
                fallback(rejection).await
            }
            outcome => outcome,
        }
    }

    /// Execute an operation whose errors are already resilience errors.
    ///
    /// Used when the breaker wraps another policy: the inner policy's error
    /// is passed through unchanged and counted as one failure.
    #[instrument(skip(self, operation), fields(name = %self.name, state = %self.state()))]
    pub async fn execute_wrapped<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(admission) = self.try_acquire() else {
            debug!("Circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen { name: self.name.clone() });
        };

        let mut call = CallGuard { breaker: self, admission, settled: false };
        let started = tokio::time::Instant::now();
        let timeout = self.options.per_call_timeout;

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                call.succeed(started.elapsed());
                Ok(value)
            }
            Ok(Err(error)) => {
                call.fail(error.to_string());
                Err(error)
            }
            Err(_) => {
                let error = ResilienceError::Timeout { name: self.name.clone(), timeout };
                warn!("Circuit breaker: operation timed out after {:?}", timeout);
                call.fail(error.to_string());
                Err(error)
            }
        }
    }

    /// Administrative override: open the breaker now, bypassing the trip
    /// condition. The break timer starts from this moment.
    pub fn force_open(&self) {
        let now = self.clock.now();
        let timestamp = self.clock.timestamp();
        let mut state = self.lock();
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.last_opened_at = Some(timestamp);
        state.probe_in_flight = false;
        warn!(name = %self.name, "Circuit breaker forced open");
    }

    /// Force the breaker closed and clear the consecutive-failure counter and
    /// last error. Cumulative statistics are kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.last_error = None;
        state.probe_in_flight = false;
        info!(name = %self.name, "Circuit breaker manually reset to closed state");
    }

    /// Consistent snapshot of state and counters
    pub fn statistics(&self) -> CircuitBreakerStatistics {
        let state = self.lock();
        let samples = state.response_times.len();
        let total: Duration = state.response_times.iter().sum();
        let average_response_time = u32::try_from(samples)
            .ok()
            .filter(|count| *count > 0)
            .map_or(Duration::ZERO, |count| total / count);

        CircuitBreakerStatistics {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            success_count: state.success_count,
            failure_count: state.failure_count,
            trip_count: state.trip_count,
            rejected_count: state.rejected_count,
            last_failure_at: state.last_failure_at,
            last_opened_at: state.last_opened_at,
            last_error: state.last_error.clone(),
            average_response_time,
            max_response_time: state.response_times.iter().max().copied().unwrap_or_default(),
            response_samples: samples,
        }
    }

    /// Zero every counter and drop the response-time window.
    ///
    /// The circuit state and its break timer are left alone, so calls in
    /// flight settle against the same state they were admitted under.
    pub fn reset_statistics(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.success_count = 0;
        state.failure_count = 0;
        state.trip_count = 0;
        state.rejected_count = 0;
        state.last_failure_at = None;
        state.last_error = None;
        state.response_times.clear();
        debug!(name = %self.name, "Circuit breaker statistics reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock()
    }

    fn try_acquire(&self) -> Option<Admission> {
        let now = self.clock.now();
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open if state.cooldown_elapsed(now, self.options.break_duration) => {
                state.state = CircuitState::HalfOpen;
                state.probe_in_flight = true;
                info!(name = %self.name, "Circuit breaker half-open, admitting probe");
                Some(Admission::Probe)
            }
            CircuitState::HalfOpen if !state.probe_in_flight => {
                state.probe_in_flight = true;
                Some(Admission::Probe)
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                state.rejected_count += 1;
                None
            }
        }
    }

    fn on_success(&self, admission: Admission, elapsed: Duration) {
        let mut state = self.lock();
        state.success_count += 1;
        state.consecutive_failures = 0;
        state.record_response_time(elapsed);

        if admission == Admission::Probe {
            state.probe_in_flight = false;
            if state.state == CircuitState::HalfOpen {
                state.state = CircuitState::Closed;
                info!(name = %self.name, "Circuit breaker closed after successful probe");
            }
        }
    }

    fn on_failure(&self, admission: Admission, message: String) {
        let now = self.clock.now();
        let timestamp = self.clock.timestamp();
        let mut state = self.lock();
        state.failure_count += 1;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(timestamp);
        state.last_error = Some(message);

        if admission == Admission::Probe {
            state.probe_in_flight = false;
            if state.state == CircuitState::HalfOpen {
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.last_opened_at = Some(timestamp);
                warn!(name = %self.name, "Circuit breaker reopened after failed probe");
            }
            return;
        }

        if state.state == CircuitState::Closed && self.should_trip(&state) {
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
            state.last_opened_at = Some(timestamp);
            state.trip_count += 1;
            warn!(
                name = %self.name,
                consecutive_failures = state.consecutive_failures,
                failure_count = state.failure_count,
                "Circuit breaker opened"
            );
        }
    }

    fn should_trip(&self, state: &BreakerState) -> bool {
        if state.consecutive_failures >= self.options.consecutive_failure_limit {
            return true;
        }

        let total = state.success_count + state.failure_count;
        total >= self.options.minimum_throughput
            && total > 0
            && state.failure_count as f64 / total as f64 >= self.options.failure_rate_threshold
    }

    fn release_probe(&self) {
        let mut state = self.lock();
        state.probe_in_flight = false;
        debug!(name = %self.name, "Half-open probe abandoned, slot released");
    }
}

/// Settles an admitted call exactly once.
///
/// If the caller's future is dropped before the operation finishes, the
/// guard frees the half-open probe slot so the breaker cannot wedge.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn succeed(&mut self, elapsed: Duration) {
        self.settled = true;
        self.breaker.on_success(self.admission, elapsed);
    }

    fn fail(&mut self, message: String) {
        self.settled = true;
        self.breaker.on_failure(self.admission, message);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.release_probe();
        }
    }
}
