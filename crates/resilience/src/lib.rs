//! Resilience policies for outbound calls between marketplace services.
//!
//! Three policies wrap an arbitrary asynchronous operation:
//! - **Circuit breaker**: stops calling a dependency that keeps failing and
//!   probes it again after a cooldown
//! - **Retry**: re-executes a failed operation with fixed, linear,
//!   exponential or jittered exponential backoff
//! - **Bulkhead**: caps concurrent calls to a dependency with a bounded wait
//!   queue
//!
//! A [`PolicyRegistry`] hands out one instance of each policy per logical
//! target name, configured from a [`ResilienceConfig`], and composes them
//! into a [`ResiliencePipeline`] (circuit breaker around retry, optionally
//! around a bulkhead).
//!
//! Every policy reports failures through the generic [`ResilienceError`],
//! which keeps rejections, timeouts and exhausted retries distinct from the
//! operation's own error.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod retry;

// Re-export the types most callers need
pub use bulkhead::{BulkheadOptions, BulkheadPolicy, BulkheadStatistics, OverflowPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStatistics, CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ResilienceConfig, TargetSettings};
pub use error::{
    BulkheadRejection, ClassifyError, ConfigError, ConfigResult, ErrorKind, ResilienceError,
    ResilienceResult, RetryStopReason,
};
pub use pipeline::ResiliencePipeline;
pub use registry::{PolicyRegistry, RegistryBuilder, RegistrySnapshot};
pub use retry::{
    BackoffStrategy, RetryAttemptRecord, RetryCall, RetryOptions, RetryPolicy, RetryStatistics,
};
