//! Retry with exponential backoff.
//!
//! Each call runs a small state machine:
//!
//! ```text
//!              ┌──────────── backoff elapsed ────────────┐
//!              ▼                                         │
//!        ┌────────────┐  retryable, budget left  ┌───────┴───┐
//! ──────►│ Attempting ├─────────────────────────►│  Backoff  │
//!        └─────┬──────┘                          └───────────┘
//!              │ success / not retryable / budget spent
//!              ▼
//!        Done | Failed (budget spent, last result returned as is)
//! ```
//!
//! A call is retried only if the failure is retryable (transport failure,
//! timeout, 429 or 503) and its request can be sent again (no body, or a
//! repeatable one). Retried calls go back through the queue and node
//! selection, so they may land on a different host.

use std::{fmt, sync::Arc, time::Duration};

use backon::{BackoffBuilder, ExponentialBuilder};
use dialogue_types::{CallError, Channel, Endpoint, Request, Response, ResponseFuture, StatusCode};
use rand::{Rng, RngCore};

use crate::{
    config::{ClientConfig, RetryConfig},
    metrics::ClientMetrics,
    refreshable::Refreshable,
};

/// What to do after an attempt.
#[derive(Debug, PartialEq, Eq)]
enum RetryState {
    /// Return the attempt's result as is.
    Done,
    /// Sleep, then attempt again.
    Backoff(Duration),
    /// Budget spent on a retryable result; report it, then return the result
    /// as is.
    Failed,
}

/// Channel that re-submits retryable failures to its delegate.
pub struct RetryingChannel {
    delegate: Arc<dyn Channel>,
    config: Refreshable<ClientConfig>,
    metrics: Arc<dyn ClientMetrics>,
}

impl RetryingChannel {
    /// Wraps `delegate`. Retry settings are read from `config` at the start
    /// of each call.
    pub fn new(
        delegate: Arc<dyn Channel>,
        config: Refreshable<ClientConfig>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        Self { delegate, config, metrics }
    }
}

impl Channel for RetryingChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        // The first attempt is submitted now so the call is queued or on a
        // host before the caller first polls.
        let first = self.delegate.execute(endpoint, request.clone());
        Box::pin(run(
            Arc::clone(&self.delegate),
            Arc::clone(&self.metrics),
            self.config.get().retry.clone(),
            endpoint.clone(),
            request,
            first,
        ))
    }
}

impl fmt::Debug for RetryingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingChannel").field("delegate", &self.delegate).finish()
    }
}

async fn run(
    delegate: Arc<dyn Channel>,
    metrics: Arc<dyn ClientMetrics>,
    retry: RetryConfig,
    endpoint: Endpoint,
    request: Request,
    first: ResponseFuture,
) -> Result<Response, CallError> {
    let replayable = request.is_replayable();
    let mut backoff = ExponentialBuilder::new()
        .with_min_delay(retry.initial_backoff)
        .with_max_delay(retry.max_backoff)
        .with_factor(retry.multiplier as f32)
        .with_max_times(retry.max_retries as usize)
        .build();
    let endpoint_label = endpoint.to_string();
    let mut attempt: u32 = 0;
    let mut call = first;

    loop {
        attempt += 1;
        let result = call.await;

        let state = match retry_label(&result) {
            Some(_) if !replayable => RetryState::Done,
            Some(_) => match backoff.next() {
                Some(delay) => RetryState::Backoff(jittered(delay, retry.jitter, &mut rand::rng())),
                None if attempt > 1 => RetryState::Failed,
                None => RetryState::Done,
            },
            None => RetryState::Done,
        };

        match state {
            RetryState::Done => return result,
            RetryState::Failed => {
                let label = retry_label(&result).unwrap_or("unknown");
                metrics.record_retries_exhausted(&endpoint_label, attempt, label);
                tracing::debug!(endpoint = %endpoint_label, attempts = attempt, reason = label, "retries exhausted");
                return result;
            },
            RetryState::Backoff(delay) => {
                let label = retry_label(&result).unwrap_or("unknown");
                metrics.record_retry(&endpoint_label, attempt, label);
                tracing::debug!(
                    endpoint = %endpoint_label,
                    attempt,
                    reason = label,
                    backoff_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                if let Ok(response) = result {
                    response.close();
                }
                tokio::time::sleep(delay).await;
                call = delegate.execute(&endpoint, request.clone());
            },
        }
    }
}

/// Metric label for a retryable result, `None` if the result is final.
fn retry_label(result: &Result<Response, CallError>) -> Option<&'static str> {
    match result {
        Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => Some("throttled"),
        Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => Some("unavailable"),
        Ok(_) => None,
        Err(e) if e.is_retryable() => Some(e.error_type()),
        Err(_) => None,
    }
}

/// Scales `delay` by a random factor in `[1 - jitter, 1 + jitter]`.
fn jittered(delay: Duration, jitter: f64, rng: &mut impl RngCore) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let jitter = jitter.min(1.0);
    delay.mul_f64(rng.random_range(1.0 - jitter..=1.0 + jitter))
}
