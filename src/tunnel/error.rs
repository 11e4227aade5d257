//! Broker error taxonomy and subprocess failure classification.
//!
//! [`BrokerError`] is what the facade returns synchronously. Establishment
//! failures never surface here; they are recorded on the tunnel instead.
//!
//! # Failure Classification
//!
//! When an SSH process dies, its diagnostic (usually the tail of stderr) is
//! classified to decide whether the supervisor should relaunch it:
//!
//! 1. **Configuration failures (NOT retryable)**: the host name does not resolve,
//!    the key is unusable or rejected, the command line is malformed. Relaunching
//!    would fail the same way, so the tunnel goes to FAILED immediately.
//!
//! 2. **Network failures (retryable)**: connection refused, reset, timed out,
//!    unreachable. These may clear on their own.
//!
//! 3. **Unknown diagnostics**: retried. The restart budget bounds the cost.
//!
//! Configuration patterns are checked first, so a diagnostic matching both
//! lists is permanent.

use thiserror::Error;

use super::types::TunnelState;

/// Errors returned by broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Malformed request or conflicting key options
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tunnel not found: {0}")]
    NotFound(String),

    #[error("tunnel already exists: {0}")]
    AlreadyExists(String),

    /// Compare-and-swap precondition did not hold
    #[error("conflict on tunnel {id}: expected state {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: TunnelState,
        actual: TunnelState,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable snake_case code for external encodings.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidArgument(_) => "invalid_argument",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::AlreadyExists(_) => "already_exists",
            BrokerError::Conflict { .. } => "conflict",
            BrokerError::ResourceExhausted(_) => "resource_exhausted",
            BrokerError::Unavailable(_) => "unavailable",
            BrokerError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Internal(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Diagnostics that mean the process will never come up with this configuration.
const PERMANENT_FAILURES: &[&str] = &[
    "name or service not known",
    "nodename nor servname provided",
    "no address associated with hostname",
    "permission denied",
    "host key verification failed",
    "load key",
    "invalid format",
    "bad port",
    "bad local forwarding specification",
    "bad configuration option",
    "command-line line",
    "no such file or directory",
    "too many authentication failures",
];

/// Diagnostics of transient network trouble.
const RETRYABLE_FAILURES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "connection closed",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "address already in use",
    "broken pipe",
    "kex_exchange_identification",
];

/// Decides whether a dead SSH process should be relaunched.
///
/// # Arguments
///
/// * `diagnostic` - Exit description, typically the last lines of stderr
///
/// # Returns
///
/// * `true` if the failure is transient and a restart may succeed
/// * `false` if the failure is a configuration error
pub(crate) fn is_retryable_failure(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();

    for pattern in PERMANENT_FAILURES {
        if lower.contains(pattern) {
            return false;
        }
    }

    for pattern in RETRYABLE_FAILURES {
        if lower.contains(pattern) {
            return true;
        }
    }

    true
}
