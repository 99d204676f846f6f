//! Liveness gating for freshly started services

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::retry::{Attempt, RetryFailure, RetryPolicy};

/// Polls a liveness endpoint with a fixed interval and a bounded number of attempts
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: Client,
    policy: RetryPolicy,
}

impl ReadinessProbe {
    pub fn new(max_attempts: u32, interval: Duration, request_timeout: Duration) -> HarnessResult<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            policy: RetryPolicy::attempts(max_attempts, interval),
        })
    }

    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        Self::new(
            config.readiness.max_attempts,
            config.readiness_interval(),
            config.readiness_request_timeout(),
        )
    }

    /// Single liveness request; any transport error or non-success status is "not ready"
    pub async fn check(&self, url: &str) -> bool {
        match self.request(url).await {
            Ok(()) => true,
            Err(observation) => {
                debug!(url, observation = %observation, "liveness check failed");
                false
            }
        }
    }

    /// One GET against `url`, describing why it is not ready on failure
    async fn request(&self, url: &str) -> Result<(), String> {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("status {}", response.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Block until `url` answers with a success status.
    ///
    /// Returns the number of attempts it took. Exhausting the attempts yields
    /// [`HarnessError::ServiceUnavailable`], which aborts the suite.
    pub async fn wait_ready(&self, url: &str) -> HarnessResult<u32> {
        info!("⏳ Waiting for {} to become ready", url);

        let result = self
            .policy
            .run(|attempt| async move {
                match self.request(url).await {
                    Ok(()) => Attempt::Ready(attempt),
                    Err(observation) => Attempt::Pending(Some(observation)),
                }
            })
            .await;

        match result {
            Ok(attempts) => {
                info!("✅ {} ready after {} attempt(s)", url, attempts);
                Ok(attempts)
            }
            Err(RetryFailure::Exhausted(exhausted)) => {
                warn!(
                    url,
                    attempts = exhausted.attempts,
                    last = exhausted.last_observation.as_deref().unwrap_or("<none>"),
                    "service never became ready"
                );
                Err(HarnessError::ServiceUnavailable {
                    url: url.to_string(),
                    attempts: exhausted.attempts,
                })
            }
            Err(RetryFailure::Aborted(err)) => Err(err),
        }
    }
}
