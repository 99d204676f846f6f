//! Waiting for long-running server-side operations
//!
//! Training a predictor is asynchronous on the service side: the request that
//! starts it may return long before the model is usable. The waiter polls a
//! [`StatusSource`] until the operation reaches a terminal state, and keeps
//! the last status seen per operation key so that backwards movement (for
//! example `complete` followed by `in_progress`) is caught as a
//! [`HarnessError::StateRegression`] rather than retried.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::retry::{Attempt, RetryFailure, RetryPolicy};

/// Status of an asynchronous operation as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

/// A status from which no further transition is expected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Complete,
    Error,
}

impl OperationStatus {
    /// Parse the spellings the service uses for each state
    pub fn parse(raw: &str) -> HarnessResult<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "training" | "analyzing" | "generating" => Ok(Self::InProgress),
            "complete" | "completed" => Ok(Self::Complete),
            "error" | "failed" => Ok(Self::Error),
            other => Err(HarnessError::mismatch(format!(
                "unknown operation status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn terminal(self) -> Option<TerminalState> {
        match self {
            Self::Complete => Some(TerminalState::Complete),
            Self::Error => Some(TerminalState::Error),
            _ => None,
        }
    }

    /// Position on the progress axis; terminal states share the top rank
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Complete | Self::Error => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TerminalState> for OperationStatus {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Complete => Self::Complete,
            TerminalState::Error => Self::Error,
        }
    }
}

/// Where the status of an operation is read from
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Current status of `key`, or `None` when the service does not know it (yet)
    async fn status(&self, key: &str) -> HarnessResult<Option<OperationStatus>>;
}

/// Polls operations to a terminal state under a deadline
pub struct AsyncOperationWaiter {
    policy: RetryPolicy,
    observed: Mutex<HashMap<String, OperationStatus>>,
}

impl AsyncOperationWaiter {
    pub fn new(deadline: Duration, interval: Duration) -> Self {
        Self {
            policy: RetryPolicy::deadline(deadline, interval),
            observed: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.training_deadline(), config.training_poll_interval())
    }

    /// Last status seen for `key` across all waits of this waiter
    pub fn last_observed(&self, key: &str) -> Option<OperationStatus> {
        self.observed.lock().get(key).copied()
    }

    /// Drop the history of `key`, e.g. after the operation was deleted on purpose
    pub fn forget(&self, key: &str) {
        self.observed.lock().remove(key);
    }

    /// Poll `source` until `key` is `complete` or `error`.
    ///
    /// A missing status is indistinguishable from "not started yet" and is
    /// retried until the deadline. Backwards progress, including a key that
    /// vanishes after it was seen, aborts with a state regression.
    pub async fn await_terminal(
        &self,
        key: &str,
        source: &dyn StatusSource,
    ) -> HarnessResult<TerminalState> {
        info!("⏳ Waiting for operation {} to finish", key);

        let result = self
            .policy
            .run(|attempt| async move {
                let status = match source.status(key).await {
                    Ok(status) => status,
                    Err(err) if err.is_retriable() => {
                        return Attempt::Pending(Some(format!("poll failed: {}", err)));
                    }
                    Err(err) => return Attempt::Abort(err),
                };

                debug!(key, attempt, status = ?status, "polled operation status");

                if let Err(err) = self.record(key, status) {
                    return Attempt::Abort(err);
                }

                match status.and_then(OperationStatus::terminal) {
                    Some(terminal) => Attempt::Ready(terminal),
                    None => Attempt::Pending(status.map(|s| s.to_string())),
                }
            })
            .await;

        match result {
            Ok(terminal) => {
                info!("✅ Operation {} reached {:?}", key, terminal);
                Ok(terminal)
            }
            Err(RetryFailure::Exhausted(exhausted)) => {
                error!(key, attempts = exhausted.attempts, "operation did not finish in time");
                Err(HarnessError::Timeout {
                    operation: key.to_string(),
                    waited_ms: exhausted.elapsed.as_millis() as u64,
                    last_state: self
                        .last_observed(key)
                        .map(|s| s.to_string())
                        .or(exhausted.last_observation)
                        .unwrap_or_else(|| "never observed".to_string()),
                })
            }
            Err(RetryFailure::Aborted(err)) => Err(err),
        }
    }

    /// Like [`await_terminal`](Self::await_terminal) but treats `error` as a failure
    pub async fn await_complete(&self, key: &str, source: &dyn StatusSource) -> HarnessResult<()> {
        match self.await_terminal(key, source).await? {
            TerminalState::Complete => Ok(()),
            TerminalState::Error => Err(HarnessError::assertion(format!(
                "operation {} finished with status error",
                key
            ))),
        }
    }

    fn record(&self, key: &str, status: Option<OperationStatus>) -> HarnessResult<()> {
        let mut observed = self.observed.lock();
        let previous = observed.get(key).copied();

        match (previous, status) {
            (Some(prev), None) => Err(HarnessError::StateRegression {
                operation: key.to_string(),
                from: prev.to_string(),
                to: "missing".to_string(),
            }),
            (Some(prev), Some(next))
                if next.rank() < prev.rank() || (prev.is_terminal() && next != prev) =>
            {
                Err(HarnessError::StateRegression {
                    operation: key.to_string(),
                    from: prev.to_string(),
                    to: next.to_string(),
                })
            }
            (_, Some(next)) => {
                observed.insert(key.to_string(), next);
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }
}
