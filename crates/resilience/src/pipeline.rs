//! Composed resilience decorator
//!
//! A [`ResiliencePipeline`] nests the policies of one target as
//! `circuit_breaker(retry(operation))`. The breaker records the outcome of
//! the whole retried sequence as a single call, so transient failures that
//! retrying absorbs never count against it. An optional bulkhead sits
//! innermost and bounds each individual attempt.

use std::future::Future;
use std::sync::Arc;

use crate::bulkhead::BulkheadPolicy;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ClassifyError, ResilienceResult};
use crate::retry::{RetryCall, RetryPolicy};

/// Circuit breaker around retry, with an optional bulkhead per attempt
#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    name: String,
    circuit_breaker: Arc<CircuitBreaker>,
    retry: Arc<RetryPolicy>,
    bulkhead: Option<Arc<BulkheadPolicy>>,
}

impl ResiliencePipeline {
    /// Compose `circuit_breaker` around `retry`, without a bulkhead
    pub fn new(
        name: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryPolicy>,
    ) -> Self {
        Self { name: name.into(), circuit_breaker, retry, bulkhead: None }
    }

    /// Bound every attempt with `bulkhead`
    pub fn with_bulkhead(mut self, bulkhead: Arc<BulkheadPolicy>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Target name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker wrapping every execution
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    /// The retry policy inside the breaker
    pub fn retry(&self) -> &Arc<RetryPolicy> {
        &self.retry
    }

    /// The per-attempt bulkhead, if configured
    pub fn bulkhead(&self) -> Option<&Arc<BulkheadPolicy>> {
        self.bulkhead.as_ref()
    }

    /// Run `operation` through the breaker and the retry policy
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        self.execute_with(operation, RetryCall::new()).await
    }

    /// Like [`execute`](Self::execute), with per-call retry hooks
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        operation: F,
        call: RetryCall<'_, E>,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        let retry = &self.retry;
        self.circuit_breaker.execute_wrapped(move || retry.execute_with(operation, call)).await
    }

    /// Run `operation` through breaker, retry and, when configured, the
    /// bulkhead. Falls back to [`execute`](Self::execute) without one.
    pub async fn execute_isolated<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        let Some(bulkhead) = &self.bulkhead else {
            return self.execute(operation).await;
        };

        let operation = Arc::new(operation);
        let retry = &self.retry;
        self.circuit_breaker
            .execute_wrapped(move || {
                retry.execute_wrapped(move || {
                    let operation = Arc::clone(&operation);
                    bulkhead.execute(move || (*operation)())
                })
            })
            .await
    }
}
