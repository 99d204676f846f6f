//! Error types for harness operations

use thiserror::Error;

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Everything that can go wrong while orchestrating a suite
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Service unavailable at {url} after {attempts} attempts")]
    ServiceUnavailable { url: String, attempts: u32 },

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Timeout waiting for {operation} after {waited_ms}ms (last state: {last_state})")]
    Timeout {
        operation: String,
        waited_ms: u64,
        last_state: String,
    },

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("State regression for {operation}: {from} -> {to}")]
    StateRegression {
        operation: String,
        from: String,
        to: String,
    },

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Fixture {fixture} failed: {message}")]
    Fixture { fixture: String, message: String },

    #[error("SQL error: status={status} body={body}")]
    Sql { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Create a new protocol mismatch error
    pub fn mismatch<S: Into<String>>(message: S) -> Self {
        Self::ProtocolMismatch(message.into())
    }

    /// Create a new assertion error
    pub fn assertion<S: Into<String>>(message: S) -> Self {
        Self::Assertion(message.into())
    }

    /// Create a new fixture error
    pub fn fixture<N: Into<String>, S: Into<String>>(fixture: N, message: S) -> Self {
        Self::Fixture {
            fixture: fixture.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new process error
    pub fn process<S: Into<String>>(message: S) -> Self {
        Self::Process(message.into())
    }

    /// Errors that abort the remaining suite instead of failing a single case
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::ServiceUnavailable { .. }
                | HarnessError::Timeout { .. }
                | HarnessError::StateRegression { .. }
                | HarnessError::Fixture { .. }
                | HarnessError::Configuration(_)
                | HarnessError::Process(_)
        )
    }

    /// Check if a poll that failed this way is worth repeating
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HarnessError::Connectivity(_) | HarnessError::Http(_) | HarnessError::Sql { .. }
        )
    }

    /// Get the error category for logs and reports
    pub fn category(&self) -> &'static str {
        match self {
            HarnessError::ServiceUnavailable { .. } => "connectivity",
            HarnessError::Connectivity(_) => "connectivity",
            HarnessError::Http(_) => "connectivity",
            HarnessError::Timeout { .. } => "timeout",
            HarnessError::ProtocolMismatch(_) => "protocol_mismatch",
            HarnessError::Json(_) => "protocol_mismatch",
            HarnessError::StateRegression { .. } => "state_regression",
            HarnessError::Assertion(_) => "assertion",
            HarnessError::Fixture { .. } => "fixture",
            HarnessError::Sql { .. } => "sql",
            HarnessError::Configuration(_) => "configuration",
            HarnessError::Process(_) => "process",
            HarnessError::Csv(_) => "csv",
            HarnessError::Io(_) => "io",
        }
    }
}

/// Fail the current case with an assertion error unless `condition` holds
#[macro_export]
macro_rules! ensure_that {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::HarnessError::assertion(format!($($arg)+)));
        }
    };
}
