//! Error types for the routing evaluation harness.

use thiserror::Error;

/// Top-level error type for evaluation operations.
///
/// The taxonomy matters for control flow: configuration errors are
/// deterministic and never retried, transient errors are retried under
/// backoff, and budget errors terminate the current case. Every variant
/// knows how many backend calls the failed operation consumed so that
/// budget bookkeeping stays accurate on failure paths.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend executable could not be located on PATH.
    #[error("backend executable not found: {0}")]
    MissingExecutable(String),

    /// Deterministic configuration problem (unsupported transport,
    /// oversized payload, invalid config file). Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Process-level failure that may resolve on retry.
    #[error("transient invocation failure: {reason}")]
    Transient { reason: String, calls: u32 },

    /// The invocation exceeded its wall-clock timeout. Consumes one call.
    #[error("invocation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Raised by the retry wrapper when the budget predicate reports
    /// exhaustion before an attempt.
    #[error("budget exhausted with {pending_calls} pending call(s)")]
    BudgetExceeded { pending_calls: u32 },

    /// IO error during harness operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns the number of backend calls the failed operation consumed.
    pub fn calls_consumed(&self) -> u32 {
        match self {
            Error::Transient { calls, .. } => *calls,
            Error::Timeout { .. } => 1,
            _ => 0,
        }
    }

    /// Returns true for deterministic errors that retrying cannot help.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::MissingExecutable(_) | Error::Config(_) | Error::Yaml(_)
        )
    }

    /// Short category label used in failure fingerprints.
    pub fn category(&self) -> &'static str {
        match self {
            Error::MissingExecutable(_) => "missing_executable",
            Error::Config(_) => "config",
            Error::Transient { .. } => "transient",
            Error::Timeout { .. } => "timeout",
            Error::BudgetExceeded { .. } => "budget",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
        }
    }
}

/// Result type alias for evaluation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by the retry wrapper, annotated with the total number
/// of backend calls consumed across all failed attempts.
#[derive(Error, Debug)]
#[error("{source} ({consumed_calls} call(s) consumed)")]
pub struct RetryError {
    /// Calls consumed by attempts that never produced a result.
    pub consumed_calls: u32,
    /// The last underlying error.
    #[source]
    pub source: Error,
}
