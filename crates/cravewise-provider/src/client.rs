use std::sync::Arc;
use std::time::Duration;

use crate::{FlightPermit, FlightTracker, LlmProvider, LlmRequest, LlmResponse, ProviderError};

/// Bounded retry for transient transport failures. `max_attempts = 1` disables retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("a model request is already in flight for session {0}")]
    InFlight(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Invokes the model with a deadline, at most once per session at a time.
#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
    retry: RetryPolicy,
    flights: FlightTracker,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            retry: RetryPolicy::default(),
            flights: FlightTracker::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Claim the session's in-flight slot. Fails if a request is already pending.
    pub async fn reserve(&self, session_key: &str) -> Result<FlightPermit, InvocationError> {
        // Slots released without a call (e.g. a crisis short-circuit) are pruned here.
        self.flights.cleanup_unused().await;
        self.flights
            .try_reserve(session_key)
            .await
            .ok_or_else(|| InvocationError::InFlight(session_key.to_string()))
    }

    pub async fn is_in_flight(&self, session_key: &str) -> bool {
        self.flights.is_in_flight(session_key).await
    }

    /// Sessions with a slot still tracked.
    pub async fn tracked_sessions(&self) -> usize {
        self.flights.tracked_sessions().await
    }

    /// Run one invocation and return the raw reply text.
    ///
    /// The call runs on its own task which owns `permit`: if the caller stops
    /// awaiting, the call still finishes and only then frees the session slot.
    pub async fn generate(
        &self,
        permit: FlightPermit,
        request: LlmRequest,
    ) -> Result<String, InvocationError> {
        let provider = Arc::clone(&self.provider);
        let flights = self.flights.clone();
        let timeout = self.timeout;
        let retry = self.retry;

        let handle = tokio::spawn(async move {
            let session = permit.session_key().to_string();
            let result = invoke_with_retry(provider.as_ref(), request, timeout, retry).await;
            match &result {
                Ok(resp) => tracing::debug!(
                    session = %session,
                    input_tokens = ?resp.input_tokens,
                    output_tokens = ?resp.output_tokens,
                    stop_reason = ?resp.stop_reason,
                    "model call finished"
                ),
                Err(e) => tracing::debug!(session = %session, error = %e, "model call failed"),
            }
            drop(permit);
            flights.cleanup_unused().await;
            result
        });

        match handle.await {
            Ok(result) => Ok(result?.text),
            Err(e) => Err(ProviderError::Transport(format!("invocation task failed: {e}")).into()),
        }
    }
}

async fn invoke_with_retry(
    provider: &dyn LlmProvider,
    request: LlmRequest,
    timeout: Duration,
    retry: RetryPolicy,
) -> Result<LlmResponse, ProviderError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, provider.chat(request.clone())).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        match result {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(attempt, max_attempts, error = %e, "model call failed, retrying");
                tokio::time::sleep(retry.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
