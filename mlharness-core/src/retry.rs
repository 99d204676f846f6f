//! Fixed-interval polling shared by readiness checks and operation waits
//!
//! A [`RetryPolicy`] bounds a polling loop either by attempt count or by a
//! wall-clock deadline. Each attempt reports whether the awaited condition is
//! met or still pending, or aborts the loop. The policy owns the sleeping and
//! the bookkeeping; callers only describe a single attempt.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::HarnessError;

/// Upper bound of a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Give up after this many attempts
    Attempts(u32),
    /// Give up once this much time has elapsed since the first attempt
    Deadline(Duration),
}

/// Outcome of a single attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Condition met; stop polling
    Ready(T),
    /// Not yet; the observation is kept for diagnostics
    Pending(Option<String>),
    /// Stop polling immediately with this error
    Abort(HarnessError),
}

/// Why a polling loop stopped without success
#[derive(Debug)]
pub enum RetryFailure {
    Exhausted(Exhausted),
    Aborted(HarnessError),
}

/// Bookkeeping of a loop that ran out of attempts or time
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_observation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: RetryLimit,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            limit: RetryLimit::Attempts(max_attempts.max(1)),
            interval,
        }
    }

    pub fn deadline(deadline: Duration, interval: Duration) -> Self {
        Self {
            limit: RetryLimit::Deadline(deadline),
            interval,
        }
    }

    /// Poll `attempt` until it is ready, aborts, or the limit is reached.
    ///
    /// The attempt closure receives the 1-based attempt number. There is no
    /// sleep after the final attempt, and a deadline loop always makes at
    /// least one attempt.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_observation = None;

        loop {
            attempts += 1;

            match attempt(attempts).await {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Abort(err) => return Err(RetryFailure::Aborted(err)),
                Attempt::Pending(observation) => {
                    debug!(
                        attempt = attempts,
                        observation = observation.as_deref().unwrap_or("<none>"),
                        "condition not met yet"
                    );
                    if observation.is_some() {
                        last_observation = observation;
                    }
                }
            }

            if self.is_exhausted(attempts, start.elapsed()) {
                return Err(RetryFailure::Exhausted(Exhausted {
                    attempts,
                    elapsed: start.elapsed(),
                    last_observation,
                }));
            }

            sleep(self.interval).await;
        }
    }

    fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        match self.limit {
            RetryLimit::Attempts(max) => attempts >= max,
            // The next attempt would start after the deadline
            RetryLimit::Deadline(deadline) => elapsed + self.interval > deadline,
        }
    }
}
