//! Named policy registry
//!
//! The registry owns every policy instance, keyed by logical target name.
//! Instances are created lazily on first lookup from the resolved
//! configuration of that name and cached for the life of the registry, so
//! all callers of a target share one breaker, one retry policy and one
//! bulkhead. Distinct targets never share state.
//!
//! The registry is cheap to clone and meant to be passed explicitly to the
//! clients that need it.
//!
//! # Examples
//!
//! ```rust
//! use marketplace_resilience::{PolicyRegistry, ResilienceConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ResilienceConfig::from_toml_str(
//!     r#"
//!     [targets.payments.circuit_breaker]
//!     consecutive_failure_limit = 3
//!     "#,
//! )?;
//! let registry = PolicyRegistry::new(config)?;
//!
//! let receipt = registry
//!     .pipeline("payments")
//!     .execute(|| async { Ok::<_, std::io::Error>("charged") })
//!     .await?;
//! # assert_eq!(receipt, "charged");
//! println!("{}", registry.snapshot().to_json()?);
//! # registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bulkhead::{BulkheadOptions, BulkheadPolicy, BulkheadStatistics};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStatistics};
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::error::{ClassifyError, ConfigResult, ErrorKind, ResilienceError, ResilienceResult};
use crate::pipeline::ResiliencePipeline;
use crate::retry::{RetryCall, RetryOptions, RetryPolicy, RetryPredicate, RetryStatistics};

/// Label of the defaults section in error messages
const DEFAULTS: &str = "defaults";

/// Fully resolved options for one target
#[derive(Debug, Clone)]
struct TargetOptions {
    circuit_breaker: CircuitBreakerOptions,
    retry: RetryOptions,
    bulkhead: BulkheadOptions,
}

/// Builder for [`PolicyRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    config: ResilienceConfig,
    clock: Option<Arc<dyn Clock>>,
    retry_predicates: HashMap<String, RetryPredicate>,
}

impl RegistryBuilder {
    /// Empty configuration, system clock, no predicate overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings every target is resolved from
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for every circuit breaker the registry creates
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the retry predicate of target `name`, taking precedence over
    /// its configured `retryable_kinds`
    pub fn retry_predicate<P>(mut self, name: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(ErrorKind) -> bool + Send + Sync + 'static,
    {
        self.retry_predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    /// Resolve and validate every configured target
    pub fn build(self) -> ConfigResult<PolicyRegistry> {
        let RegistryBuilder { config, clock, retry_predicates } = self;
        config.validate()?;

        // `None` resolves the defaults section without any target layered on
        let resolve = |name: Option<&str>| -> ConfigResult<TargetOptions> {
            let mut retry = config.retry_builder(name);
            if let Some(predicate) = name.and_then(|name| retry_predicates.get(name)) {
                let predicate = Arc::clone(predicate);
                retry = retry.retry_predicate(move |kind| predicate(kind));
            }
            Ok(TargetOptions {
                circuit_breaker: config.resolve_circuit_breaker(name)?,
                retry: retry.build().map_err(|e| e.for_target(name.unwrap_or(DEFAULTS)))?,
                bulkhead: config.resolve_bulkhead(name)?,
            })
        };

        let defaults = resolve(None)?;
        let mut targets = HashMap::new();
        for name in config.target_names().chain(retry_predicates.keys().map(String::as_str)) {
            targets.insert(name.to_string(), resolve(Some(name))?);
        }
        debug!(targets = targets.len(), "Resilience registry built");

        Ok(PolicyRegistry {
            inner: Arc::new(RegistryInner {
                defaults,
                targets,
                clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
                circuit_breakers: Mutex::new(HashMap::new()),
                retry_policies: Mutex::new(HashMap::new()),
                bulkheads: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("config", &self.config)
            .field("retry_predicates", &self.retry_predicates.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

struct RegistryInner {
    defaults: TargetOptions,
    targets: HashMap<String, TargetOptions>,
    clock: Arc<dyn Clock>,
    circuit_breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    retry_policies: Mutex<HashMap<String, Arc<RetryPolicy>>>,
    bulkheads: Mutex<HashMap<String, Arc<BulkheadPolicy>>>,
}

impl RegistryInner {
    fn options(&self, name: &str) -> &TargetOptions {
        self.targets.get(name).unwrap_or(&self.defaults)
    }
}

/// Shared, lazily populated set of policies per target name
#[derive(Clone)]
pub struct PolicyRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("configured_targets", &self.inner.targets.len())
            .field("circuit_breakers", &self.inner.circuit_breakers.lock().len())
            .field("retry_policies", &self.inner.retry_policies.lock().len())
            .field("bulkheads", &self.inner.bulkheads.lock().len())
            .finish()
    }
}

impl PolicyRegistry {
    /// Build a registry from `config` with the system clock
    pub fn new(config: ResilienceConfig) -> ConfigResult<Self> {
        Self::builder().config(config).build()
    }

    /// Start a [`RegistryBuilder`] for a custom clock or retry predicates
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// The circuit breaker for `name`, created on first use
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.inner.circuit_breakers.lock();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(policy = "circuit_breaker", name, "Creating policy instance");
            Arc::new(CircuitBreaker::with_clock(
                name,
                self.inner.options(name).circuit_breaker.clone(),
                Arc::clone(&self.inner.clock),
            ))
        });
        Arc::clone(breaker)
    }

    /// The retry policy for `name`, created on first use
    pub fn retry(&self, name: &str) -> Arc<RetryPolicy> {
        let mut policies = self.inner.retry_policies.lock();
        let policy = policies.entry(name.to_string()).or_insert_with(|| {
            debug!(policy = "retry", name, "Creating policy instance");
            Arc::new(RetryPolicy::new(name, self.inner.options(name).retry.clone()))
        });
        Arc::clone(policy)
    }

    /// The bulkhead for `name`, created (and its worker started) on first use.
    ///
    /// # Panics
    ///
    /// Creating a bulkhead panics outside a Tokio runtime.
    pub fn bulkhead(&self, name: &str) -> Arc<BulkheadPolicy> {
        let mut bulkheads = self.inner.bulkheads.lock();
        let bulkhead = bulkheads.entry(name.to_string()).or_insert_with(|| {
            debug!(policy = "bulkhead", name, "Creating policy instance");
            Arc::new(BulkheadPolicy::new(name, self.inner.options(name).bulkhead.clone()))
        });
        Arc::clone(bulkhead)
    }

    /// Breaker around retry for `name`
    pub fn pipeline(&self, name: &str) -> ResiliencePipeline {
        ResiliencePipeline::new(name, self.circuit_breaker(name), self.retry(name))
    }

    /// Breaker around retry around bulkhead for `name`
    pub fn isolated_pipeline(&self, name: &str) -> ResiliencePipeline {
        self.pipeline(name).with_bulkhead(self.bulkhead(name))
    }

    /// Run `operation` under the circuit breaker of `name`
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.circuit_breaker(name).execute(operation).await
    }

    /// Breaker-protected call whose rejection is handed to `fallback`
    pub async fn execute_with_circuit_breaker_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        name: &str,
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
        self.circuit_breaker(name).execute_with_fallback(operation, fallback).await
    }

    /// Retried call; `call` carries the per-call predicate, retry hook and
    /// cancellation token
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
        call: RetryCall<'_, E>,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ClassifyError + Send + Sync + 'static,
    {
        self.retry(name).execute_with(operation, call).await
    }

    /// Run `operation` inside the bulkhead of `name`
    pub async fn execute_with_bulkhead<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.bulkhead(name).execute(operation).await
    }

    /// Bulkhead-isolated call whose rejection is handed to `fallback`
    pub async fn execute_with_bulkhead_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        name: &str,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        FB: FnOnce(ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = ResilienceResult<T, E>>,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.bulkhead(name).execute_with_fallback(operation, fallback).await
    }

    /// Statistics of every instance created so far
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            captured_at: self.inner.clock.timestamp(),
            circuit_breakers: collect_statistics(&self.inner.circuit_breakers, |b| b.statistics()),
            retries: collect_statistics(&self.inner.retry_policies, |r| r.statistics()),
            bulkheads: collect_statistics(&self.inner.bulkheads, |b| b.statistics()),
        }
    }

    /// Zero the counters of every instance; circuit states are untouched
    pub fn reset_all_statistics(&self) {
        for breaker in instances(&self.inner.circuit_breakers) {
            breaker.reset_statistics();
        }
        for policy in instances(&self.inner.retry_policies) {
            policy.reset_statistics();
        }
        for bulkhead in instances(&self.inner.bulkheads) {
            bulkhead.reset_statistics();
        }
        info!("Reset statistics of all resilience policies");
    }

    /// Close every circuit breaker
    pub fn reset_all_circuit_breakers(&self) {
        for breaker in instances(&self.inner.circuit_breakers) {
            breaker.reset();
        }
        info!("Reset all circuit breakers");
    }

    /// Open the breaker of `name` until its break duration elapses
    pub fn force_open(&self, name: &str) {
        self.circuit_breaker(name).force_open();
    }

    /// Stop the queue worker of every bulkhead created so far.
    ///
    /// Stopped bulkheads stay cached, so later calls for those names
    /// return [`ResilienceError::ShutDown`].
    pub async fn shutdown(&self) {
        for bulkhead in instances(&self.inner.bulkheads) {
            bulkhead.shutdown().await;
        }
        info!("Resilience registry shut down");
    }
}

/// Clone the instances out so no registry lock is held while they run
fn instances<P>(map: &Mutex<HashMap<String, Arc<P>>>) -> Vec<Arc<P>> {
    map.lock().values().cloned().collect()
}

fn collect_statistics<P, S>(
    map: &Mutex<HashMap<String, Arc<P>>>,
    statistics: impl Fn(&P) -> S,
) -> BTreeMap<String, S> {
    let entries: Vec<(String, Arc<P>)> =
        map.lock().iter().map(|(name, policy)| (name.clone(), Arc::clone(policy))).collect();
    entries.into_iter().map(|(name, policy)| (name, statistics(&policy))).collect()
}

/// Aggregate statistics export, keyed by policy type then target name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
    /// Circuit breaker statistics by target name
    pub circuit_breakers: BTreeMap<String, CircuitBreakerStatistics>,
    /// Retry statistics by target name
    pub retries: BTreeMap<String, RetryStatistics>,
    /// Bulkhead statistics by target name
    pub bulkheads: BTreeMap<String, BulkheadStatistics>,
}

impl RegistrySnapshot {
    /// Pretty-printed JSON for external metrics pipelines
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
