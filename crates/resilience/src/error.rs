//! Error taxonomy shared by every policy
//!
//! Policies never hand back an opaque error: a rejected call, a timed-out
//! call, an exhausted retry sequence and the wrapped operation's own failure
//! are distinct variants of [`ResilienceError`], so callers can route
//! "the dependency is being protected" differently from "the dependency
//! answered with an error".
//!
//! Retryability is decided over an [`ErrorKind`] value rather than the
//! concrete error type. Operation errors expose their kind through
//! [`ClassifyError`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryAttemptRecord;

/// Coarse classification of a failure, used by retry predicates and
/// statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure (DNS, TLS, broken pipe)
    Network,
    /// Connection refused, reset or aborted
    Connection,
    /// The operation or one of its I/O steps timed out
    Timeout,
    /// The dependency asked us to slow down
    RateLimited,
    /// The dependency is unavailable or is being protected by a breaker
    Unavailable,
    /// A resilience policy refused to admit the call
    Rejected,
    /// The caller gave up
    Cancelled,
    /// The request itself was malformed
    InvalidInput,
    /// The requested resource does not exist
    NotFound,
    /// Authentication or authorization failed
    Unauthorized,
    /// A bug or invariant violation on the remote side
    Internal,
    /// Anything not covered above
    Other,
}

impl ErrorKind {
    /// Whether the default retry predicate treats this kind as transient.
    ///
    /// Only network, connection and timeout failures qualify.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Connection | Self::Timeout)
    }

    /// Stable snake_case name, matching the serialized form
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can report their [`ErrorKind`].
///
/// Implement this for the error type of every operation wrapped by a retry
/// policy. `std::io::Error` is supported out of the box.
pub trait ClassifyError {
    /// Classify this error
    fn error_kind(&self) -> ErrorKind;
}

impl ClassifyError for std::io::Error {
    fn error_kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;

        match self.kind() {
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected => ErrorKind::Connection,
            Io::BrokenPipe | Io::AddrInUse | Io::AddrNotAvailable | Io::UnexpectedEof => {
                ErrorKind::Network
            }
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::Unauthorized,
            Io::InvalidInput | Io::InvalidData => ErrorKind::InvalidInput,
            Io::Interrupted => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }
}

/// Invalid policy configuration, raised at construction time
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent with another value
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// The configuration document could not be parsed
    #[error("Failed to parse resilience configuration")]
    Parse {
        #[source]
        source: toml::de::Error,
    },

    /// The configuration file could not be read
    #[error("Failed to read resilience configuration from {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }

    /// Prefix the message with the target it belongs to
    pub(crate) fn for_target(self, target: &str) -> Self {
        match self {
            Self::Invalid { message } => Self::Invalid { message: format!("{target}: {message}") },
            other => other,
        }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Why a retry sequence stopped without a success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStopReason {
    /// `max_attempts` retries were used up
    MaxAttemptsReached,
    /// The retry predicate classified the last error as permanent
    NonRetryable,
    /// Cancellation was requested between attempts
    Cancelled,
}

impl fmt::Display for RetryStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxAttemptsReached => f.write_str("maximum attempts reached"),
            Self::NonRetryable => f.write_str("error is not retryable"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Why a bulkhead refused a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkheadRejection {
    /// Every slot and every queue position was taken
    QueueFull,
    /// The call was queued and later displaced by a newer one
    Evicted,
}

impl fmt::Display for BulkheadRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => f.write_str("wait queue full"),
            Self::Evicted => f.write_str("evicted from wait queue"),
        }
    }
}

/// Errors produced by resilience policies.
///
/// Generic over the wrapped operation's error `E`, which is preserved in
/// [`ResilienceError::OperationFailed`] and, for exhausted retries, at the
/// bottom of [`ResilienceError::RetryExhausted`].
///
/// `Display` and `Error` are implemented by hand: the retry variant boxes
/// another `ResilienceError<E>`, and a derived impl would require itself.
#[derive(Debug)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The breaker is open (or its half-open probe slot is taken)
    CircuitOpen { name: String },

    /// The operation exceeded the per-call timeout
    Timeout { name: String, timeout: Duration },

    /// The retry policy gave up
    RetryExhausted {
        name: String,
        attempts: Vec<RetryAttemptRecord>,
        reason: RetryStopReason,
        last_error: Box<ResilienceError<E>>,
    },

    /// The bulkhead had no capacity for this call
    BulkheadRejected { name: String, reason: BulkheadRejection },

    /// The caller's cancellation token fired while waiting
    Cancelled,

    /// The policy was shut down before the call could run
    ShutDown { name: String },

    /// The wrapped operation failed on its own
    OperationFailed { source: E },
}

impl<E> fmt::Display for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { name } => {
                write!(f, "Circuit breaker '{name}' is open, rejecting calls")
            }
            Self::Timeout { name, timeout } => {
                write!(f, "Operation on '{name}' timed out after {timeout:?}")
            }
            Self::RetryExhausted { name, attempts, reason, .. } => write!(
                f,
                "Retries for '{name}' exhausted after {} attempts ({reason})",
                attempts.len()
            ),
            Self::BulkheadRejected { name, reason } => {
                write!(f, "Bulkhead '{name}' rejected call: {reason}")
            }
            Self::Cancelled => f.write_str("Operation cancelled"),
            Self::ShutDown { name } => write!(f, "Policy '{name}' has been shut down"),
            Self::OperationFailed { source } => write!(f, "Operation failed: {source}"),
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { last_error, .. } => Some(&**last_error),
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Wrap an operation error
    pub fn operation(source: E) -> Self {
        Self::OperationFailed { source }
    }

    /// True when the call was refused without running the operation
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadRejected { .. } | Self::ShutDown { .. }
        )
    }

    /// True when a per-call timeout fired
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Attempt history, if this is an exhausted retry
    pub fn attempts(&self) -> Option<&[RetryAttemptRecord]> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(attempts),
            _ => None,
        }
    }

    /// The wrapped operation's own error, looking through retry exhaustion
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            Self::RetryExhausted { last_error, .. } => last_error.operation_error(),
            _ => None,
        }
    }

    /// Consume and return the wrapped operation's own error, if any
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            Self::RetryExhausted { last_error, .. } => last_error.into_operation_error(),
            _ => None,
        }
    }
}

impl<E> ClassifyError for ResilienceError<E>
where
    E: std::error::Error + ClassifyError + Send + Sync + 'static,
{
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } | Self::ShutDown { .. } => ErrorKind::Unavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RetryExhausted { last_error, .. } => last_error.error_kind(),
            Self::BulkheadRejected { .. } => ErrorKind::Rejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::OperationFailed { source } => source.error_kind(),
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::io;

    use super::*;

    #[test]
    fn test_io_error_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");

        assert_eq!(refused.error_kind(), ErrorKind::Connection);
        assert_eq!(timed_out.error_kind(), ErrorKind::Timeout);
        assert_eq!(missing.error_kind(), ErrorKind::NotFound);
        assert_eq!(io::Error::other("boom").error_kind(), ErrorKind::Other);
    }

    /// Validates which kinds the default predicate retries.
    ///
    /// Assertions:
    /// - Network, connection and timeout kinds are transient.
    /// - Validation, auth and rejection kinds are not.
    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::Connection.is_transient());
        assert!(ErrorKind::Timeout.is_transient());

        assert!(!ErrorKind::InvalidInput.is_transient());
        assert!(!ErrorKind::Unauthorized.is_transient());
        assert!(!ErrorKind::Rejected.is_transient());
        assert!(!ErrorKind::Unavailable.is_transient());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
        assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid_input");
    }

    #[test]
    fn test_operation_error_through_retry_exhaustion() {
        let err: ResilienceError<io::Error> = ResilienceError::RetryExhausted {
            name: "matchmaking".to_string(),
            attempts: Vec::new(),
            reason: RetryStopReason::MaxAttemptsReached,
            last_error: Box::new(ResilienceError::operation(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset",
            ))),
        };

        assert!(!err.is_rejection());
        assert_eq!(err.error_kind(), ErrorKind::Connection);
        assert_eq!(
            err.operation_error().map(io::Error::kind),
            Some(io::ErrorKind::ConnectionReset)
        );
        assert!(err.to_string().contains("matchmaking"));
        assert!(err.into_operation_error().is_some());
    }

    /// Validates that policy errors behave as ordinary boxed errors.
    ///
    /// Assertions:
    /// - An exhausted retry coerces into `Box<dyn Error + Send + Sync>`.
    /// - `source()` walks from the retry error to the operation failure and
    ///   then to the underlying `io::Error`.
    #[test]
    fn test_boxed_error_source_chain() {
        fn into_boxed(
            err: ResilienceError<io::Error>,
        ) -> Box<dyn std::error::Error + Send + Sync> {
            Box::new(err)
        }

        let boxed = into_boxed(ResilienceError::RetryExhausted {
            name: "inventory".to_string(),
            attempts: Vec::new(),
            reason: RetryStopReason::NonRetryable,
            last_error: Box::new(ResilienceError::operation(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed sku",
            ))),
        });

        let failed = boxed.source().expect("retry error has a source");
        assert_eq!(failed.to_string(), "Operation failed: malformed sku");
        let root = failed.source().expect("operation failure has a source");
        assert_eq!(root.to_string(), "malformed sku");
        assert!(root.source().is_none());
    }

    #[test]
    fn test_question_mark_into_boxed_error() {
        fn lookup() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err::<(), _>(ResilienceError::<io::Error>::Cancelled)?;
            Ok(())
        }

        let err = lookup().unwrap_err();
        assert_eq!(err.to_string(), "Operation cancelled");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_rejections_are_distinguishable() {
        let open: ResilienceError<io::Error> =
            ResilienceError::CircuitOpen { name: "notifications".to_string() };
        let full: ResilienceError<io::Error> = ResilienceError::BulkheadRejected {
            name: "notifications".to_string(),
            reason: BulkheadRejection::QueueFull,
        };
        let timeout: ResilienceError<io::Error> = ResilienceError::Timeout {
            name: "notifications".to_string(),
            timeout: Duration::from_secs(1),
        };

        assert!(open.is_rejection());
        assert!(full.is_rejection());
        assert!(!timeout.is_rejection());
        assert!(timeout.is_timeout());
        assert_eq!(open.error_kind(), ErrorKind::Unavailable);
        assert_eq!(full.error_kind(), ErrorKind::Rejected);
        assert!(open.operation_error().is_none());
    }

    #[test]
    fn test_config_error_for_target() {
        let err =
            ConfigError::invalid("max_parallelism must be greater than 0").for_target("catalog");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: catalog: max_parallelism must be greater than 0"
        );
    }
}
