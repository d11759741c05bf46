//! Error types for the harness
//!
//! Errors fall into two triage buckets (see [`FailureCategory`]): failures that
//! mean the reconciler under test misbehaved, and failures of the test
//! environment itself. Reports keep the two apart.

use std::time::Duration;

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A prerequisite could not be provisioned (namespace, secret, network, ...)
    #[error("setup error: {0}")]
    Setup(String),

    /// A convergence predicate was never satisfied within the absolute timeout
    #[error("timed out after {elapsed:?} waiting for {what}; last observed: {last_observed}")]
    ConvergenceTimeout {
        /// What was being waited for
        what: String,
        /// Time spent waiting
        elapsed: Duration,
        /// Last observed status or fetch error
        last_observed: String,
    },

    /// Fetching the watched object kept failing
    #[error("fetch of {what} failed {attempts} times in a row: {last_error}")]
    TransientFetch {
        /// What was being fetched
        what: String,
        /// Consecutive failed attempts
        attempts: u32,
        /// Last fetch error
        last_error: String,
    },

    /// The reconciler reported a terminal failure for the object
    #[error("reconciliation of {what} failed: {reason}")]
    ReconcileFailed {
        /// Object description
        what: String,
        /// Reason reported in the object status
        reason: String,
    },

    /// A post-condition on the converged state did not hold
    #[error("verification failed [{check}]: {detail}")]
    VerificationMismatch {
        /// Name of the failed check
        check: String,
        /// What was expected versus what was found
        detail: String,
    },

    /// A cleanup action failed
    #[error("teardown of {action} failed: {reason}")]
    Teardown {
        /// Description of the cleanup action
        action: String,
        /// Underlying failure
        reason: String,
    },

    /// A provider resource does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind (network, router, ...)
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Provider API error
    #[error("provider error ({status}): {message}")]
    Provider {
        /// HTTP status code, 0 when the request never completed
        status: u16,
        /// Error body or transport failure
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid input or illegal state transition
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or malformed configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Which side of the test a failure implicates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCategory {
    /// The reconciler under test behaved incorrectly
    SystemUnderTest,
    /// The harness or its environment is broken
    Environment,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SystemUnderTest => write!(f, "system-under-test"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

impl Error {
    /// Create a setup error with the given message
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a verification mismatch for the named check
    pub fn mismatch(check: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::VerificationMismatch {
            check: check.into(),
            detail: detail.into(),
        }
    }

    /// Create a not-found error for a provider resource
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a provider error with an HTTP status
    pub fn provider(status: u16, msg: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap any error as a setup failure, keeping its message
    pub fn into_setup(self, step: &str) -> Self {
        match self {
            Self::Setup(_) => self,
            other => Self::Setup(format!("{step}: {other}")),
        }
    }

    /// Returns true if this is a provider not-found error
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Provider { status, .. } => *status == 404,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Returns true for provider failures worth retrying (conflicts, throttling,
    /// server errors, transport failures)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { status, .. } => {
                matches!(*status, 0 | 409 | 429) || (500..600).contains(status)
            }
            Self::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Self::Kube(_) => true,
            _ => false,
        }
    }

    /// Triage bucket for reporting
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::ConvergenceTimeout { .. }
            | Self::ReconcileFailed { .. }
            | Self::VerificationMismatch { .. } => FailureCategory::SystemUnderTest,
            _ => FailureCategory::Environment,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
        Self::Provider {
            status,
            message: e.to_string(),
        }
    }
}
