//! Per-target policy configuration
//!
//! Configuration is supplied once at startup as a TOML document: a
//! `[defaults]` table applied to every target, and one `[targets.<name>]`
//! table per logical target overriding individual fields. Every resolved
//! target is validated eagerly so invalid values fail at construction.
//!
//! ```toml
//! [defaults.retry]
//! max_attempts = 3
//! base_delay_ms = 100
//!
//! [targets.payments.circuit_breaker]
//! consecutive_failure_limit = 3
//! break_duration_ms = 10000
//!
//! [targets.payments.bulkhead]
//! max_parallelism = 2
//! max_queue_length = 1
//! overflow = "drop_oldest"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bulkhead::{BulkheadOptions, BulkheadOptionsBuilder, OverflowPolicy};
use crate::circuit_breaker::{CircuitBreakerOptions, CircuitBreakerOptionsBuilder};
use crate::error::{ConfigError, ConfigResult, ErrorKind};
use crate::retry::{BackoffStrategy, RetryOptions, RetryOptionsBuilder};

/// Serialize a `Duration` as integer milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Write `duration` as milliseconds, saturating at `u64::MAX`
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Read milliseconds into a `Duration`
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same encoding for optional fields
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Write an optional duration as milliseconds
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> super::SerializeResult<S>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Read optional milliseconds
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Circuit breaker overrides; unset fields inherit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    /// See [`CircuitBreakerOptions::consecutive_failure_limit`]
    pub consecutive_failure_limit: Option<u32>,
    /// See [`CircuitBreakerOptions::failure_rate_threshold`]
    pub failure_rate_threshold: Option<f64>,
    /// See [`CircuitBreakerOptions::minimum_throughput`]
    pub minimum_throughput: Option<u64>,
    /// TOML key `break_duration_ms`
    #[serde(
        rename = "break_duration_ms",
        with = "duration_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub break_duration: Option<Duration>,
    /// TOML key `per_call_timeout_ms`
    #[serde(
        rename = "per_call_timeout_ms",
        with = "duration_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub per_call_timeout: Option<Duration>,
}

impl CircuitBreakerSettings {
    fn apply(&self, mut builder: CircuitBreakerOptionsBuilder) -> CircuitBreakerOptionsBuilder {
        if let Some(limit) = self.consecutive_failure_limit {
            builder = builder.consecutive_failure_limit(limit);
        }
        if let Some(threshold) = self.failure_rate_threshold {
            builder = builder.failure_rate_threshold(threshold);
        }
        if let Some(throughput) = self.minimum_throughput {
            builder = builder.minimum_throughput(throughput);
        }
        if let Some(duration) = self.break_duration {
            builder = builder.break_duration(duration);
        }
        if let Some(timeout) = self.per_call_timeout {
            builder = builder.per_call_timeout(timeout);
        }
        builder
    }
}

/// Retry overrides; unset fields inherit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_attempts: Option<u32>,
    /// TOML key `base_delay_ms`
    #[serde(
        rename = "base_delay_ms",
        with = "duration_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_delay: Option<Duration>,
    /// TOML key `max_delay_ms`
    #[serde(
        rename = "max_delay_ms",
        with = "duration_millis::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_delay: Option<Duration>,
    /// `fixed`, `linear`, `exponential` or `exponential_with_jitter`
    pub backoff: Option<BackoffStrategy>,
    /// Error kinds to retry; when unset, transient kinds are retried
    pub retryable_kinds: Option<Vec<ErrorKind>>,
}

impl RetrySettings {
    fn apply(&self, mut builder: RetryOptionsBuilder) -> RetryOptionsBuilder {
        if let Some(attempts) = self.max_attempts {
            builder = builder.max_attempts(attempts);
        }
        if let Some(delay) = self.base_delay {
            builder = builder.base_delay(delay);
        }
        if let Some(delay) = self.max_delay {
            builder = builder.max_delay(delay);
        }
        if let Some(strategy) = self.backoff {
            builder = builder.backoff(strategy);
        }
        if let Some(kinds) = &self.retryable_kinds {
            builder = builder.retryable_kinds(kinds.clone());
        }
        builder
    }
}

/// Bulkhead overrides; unset fields inherit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadSettings {
    /// Concurrent executions allowed
    pub max_parallelism: Option<usize>,
    /// Wait queue capacity
    pub max_queue_length: Option<usize>,
    /// `reject_newest` or `drop_oldest`
    pub overflow: Option<OverflowPolicy>,
}

impl BulkheadSettings {
    fn apply(&self, mut builder: BulkheadOptionsBuilder) -> BulkheadOptionsBuilder {
        if let Some(max) = self.max_parallelism {
            builder = builder.max_parallelism(max);
        }
        if let Some(max) = self.max_queue_length {
            builder = builder.max_queue_length(max);
        }
        if let Some(overflow) = self.overflow {
            builder = builder.overflow(overflow);
        }
        builder
    }
}

/// Settings for one logical target, each section optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetSettings {
    /// `[<section>.circuit_breaker]`
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    /// `[<section>.retry]`
    pub retry: Option<RetrySettings>,
    /// `[<section>.bulkhead]`
    pub bulkhead: Option<BulkheadSettings>,
}

/// Resilience configuration for every named target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Applied to every target; alone, it configures unlisted names
    pub defaults: TargetSettings,
    /// Per-target overrides keyed by target name
    pub targets: BTreeMap<String, TargetSettings>,
}

impl ResilienceConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(document: &str) -> ConfigResult<Self> {
        let config: Self =
            toml::from_str(document).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        debug!(targets = config.targets.len(), "Loaded resilience configuration");
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_toml_str(&document)
    }

    /// Add or replace the settings of one target
    pub fn with_target(mut self, name: impl Into<String>, settings: TargetSettings) -> Self {
        self.targets.insert(name.into(), settings);
        self
    }

    /// Resolve every policy of the defaults and of each named target
    pub fn validate(&self) -> ConfigResult<()> {
        let targets = self.targets.keys().map(|name| Some(name.as_str()));
        for name in std::iter::once(None).chain(targets) {
            let label = name.unwrap_or("defaults");
            self.resolve_circuit_breaker(name).map_err(|e| e.for_target(label))?;
            self.retry_builder(name).build().map_err(|e| e.for_target(label))?;
            self.resolve_bulkhead(name).map_err(|e| e.for_target(label))?;
        }
        Ok(())
    }

    /// Names of the configured targets, in sorted order
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Circuit breaker options for `name`; unknown names get the defaults
    pub fn circuit_breaker_options(&self, name: &str) -> ConfigResult<CircuitBreakerOptions> {
        self.resolve_circuit_breaker(Some(name))
    }

    /// Retry options for `name`; unknown names get the defaults
    pub fn retry_options(&self, name: &str) -> ConfigResult<RetryOptions> {
        self.retry_builder(Some(name)).build()
    }

    /// Bulkhead options for `name`; unknown names get the defaults
    pub fn bulkhead_options(&self, name: &str) -> ConfigResult<BulkheadOptions> {
        self.resolve_bulkhead(Some(name))
    }

    /// `None` resolves the defaults section alone
    pub(crate) fn resolve_circuit_breaker(
        &self,
        name: Option<&str>,
    ) -> ConfigResult<CircuitBreakerOptions> {
        let mut builder = CircuitBreakerOptions::builder();
        for settings in self.layers(name, |t| t.circuit_breaker.as_ref()) {
            builder = settings.apply(builder);
        }
        builder.build()
    }

    pub(crate) fn resolve_bulkhead(&self, name: Option<&str>) -> ConfigResult<BulkheadOptions> {
        let mut builder = BulkheadOptions::builder();
        for settings in self.layers(name, |t| t.bulkhead.as_ref()) {
            builder = settings.apply(builder);
        }
        builder.build()
    }

    /// Unvalidated retry builder, so callers can still swap the predicate
    pub(crate) fn retry_builder(&self, name: Option<&str>) -> RetryOptionsBuilder {
        let mut builder = RetryOptions::builder();
        for settings in self.layers(name, |t| t.retry.as_ref()) {
            builder = settings.apply(builder);
        }
        builder
    }

    /// Defaults first, then the target's own section
    fn layers<'a, S: 'a>(
        &'a self,
        name: Option<&str>,
        section: impl Fn(&'a TargetSettings) -> Option<&'a S>,
    ) -> impl Iterator<Item = &'a S> {
        let target = name.and_then(|name| self.targets.get(name)).and_then(&section);
        section(&self.defaults).into_iter().chain(target)
    }
}
