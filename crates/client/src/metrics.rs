//! Pipeline metrics for observability and operational monitoring.
//!
//! This module provides a pluggable metrics trait (`ClientMetrics`) that
//! callers can implement to collect telemetry from the pipeline. Two
//! implementations are included:
//!
//! - [`NoopClientMetrics`]: Zero-overhead default that discards all metrics.
//! - [`MetricsClientMetrics`]: Integration with the [`metrics`](https://docs.rs/metrics) crate
//!   facade, forwarding to whatever recorder is installed.
//!
//! # Metric Names
//!
//! All metrics follow the `dialogue_` prefix convention and carry a `client`
//! label:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `dialogue_limiter_admissions_total` | Counter | `host`, `result` | Limiter admit/reject decisions |
//! | `dialogue_limiter_in_flight` | Gauge | `host` | Calls in flight per host |
//! | `dialogue_limiter_limit` | Gauge | `host` | Current adaptive concurrency limit |
//! | `dialogue_queue_depth` | Gauge | | Entries waiting in the queue |
//! | `dialogue_retries_total` | Counter | `endpoint`, `attempt`, `error_type` | Retry attempts |
//! | `dialogue_retries_exhausted_total` | Counter | `endpoint`, `error_type` | Calls that spent their retry budget |
//! | `dialogue_dns_lookups_total` | Counter | `hostname`, `outcome` | DNS lookups by outcome |
//! | `dialogue_blacklist_total` | Counter | `host`, `reason` | Hosts blacklisted |
//! | `dialogue_requests_total` | Counter | `endpoint`, `status` | Top-level calls by outcome |
//! | `dialogue_request_duration_seconds` | Histogram | `endpoint` | Top-level call latency |

use std::{fmt, sync::Arc, time::Duration};

/// Outcome of one hostname lookup by the DNS worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsOutcome {
    /// Lookup returned addresses.
    Success,
    /// Lookup failed and no previous result existed.
    Failure,
    /// Lookup failed or came back empty; last-known-good addresses were used.
    Fallback,
    /// Lookup returned no addresses and no previous result existed.
    Empty,
}

impl fmt::Display for DnsOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Fallback => write!(f, "fallback"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

/// Trait for pipeline metrics collection.
///
/// All methods have default no-op implementations, so you only need to
/// override the metrics you care about.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one instance is shared by every
/// stage of a pipeline and by its DNS worker task.
pub trait ClientMetrics: Send + Sync + fmt::Debug {
    /// Records a concurrency limiter admission decision.
    fn record_admission(&self, host: &str, admitted: bool) {
        let _ = (host, admitted);
    }

    /// Records the number of calls in flight on a host.
    fn record_in_flight(&self, host: &str, in_flight: usize) {
        let _ = (host, in_flight);
    }

    /// Records a change of a host's adaptive concurrency limit.
    fn record_concurrency_limit(&self, host: &str, limit: f64) {
        let _ = (host, limit);
    }

    /// Records the number of entries waiting in the queue.
    fn record_queue_depth(&self, depth: usize) {
        let _ = depth;
    }

    /// Records a retry attempt.
    ///
    /// - `endpoint`: The endpoint being retried.
    /// - `attempt`: The attempt about to run (2 = first retry).
    /// - `error_type`: Classification of the failure that triggered it.
    fn record_retry(&self, endpoint: &str, attempt: u32, error_type: &str) {
        let _ = (endpoint, attempt, error_type);
    }

    /// Records a call whose retry budget ran out on a retryable failure.
    ///
    /// `attempts` counts the first attempt.
    fn record_retries_exhausted(&self, endpoint: &str, attempts: u32, error_type: &str) {
        let _ = (endpoint, attempts, error_type);
    }

    /// Records the outcome of a DNS lookup.
    fn record_dns_lookup(&self, hostname: &str, outcome: DnsOutcome) {
        let _ = (hostname, outcome);
    }

    /// Records a host being blacklisted.
    fn record_blacklist(&self, host: &str, reason: &str) {
        let _ = (host, reason);
    }

    /// Records a completed top-level call, after retries resolve.
    fn record_request(&self, endpoint: &str, duration: Duration, success: bool) {
        let _ = (endpoint, duration, success);
    }
}

/// No-op metrics implementation with zero overhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClientMetrics;

impl ClientMetrics for NoopClientMetrics {}

/// Metrics implementation using the [`metrics`](https://docs.rs/metrics) crate facade.
///
/// Every metric carries a `client` label with the configured client name.
#[derive(Debug, Clone)]
pub struct MetricsClientMetrics {
    client: Arc<str>,
}

impl MetricsClientMetrics {
    /// Creates a recorder labelled with `client`.
    #[must_use]
    pub fn new(client: impl Into<Arc<str>>) -> Self {
        Self { client: client.into() }
    }

    fn client(&self) -> String {
        self.client.to_string()
    }
}

/// Metric name constants for the `metrics` crate facade.
mod metric_names {
    /// Limiter admit/reject decisions.
    pub const ADMISSIONS_TOTAL: &str = "dialogue_limiter_admissions_total";
    /// Calls in flight per host.
    pub const IN_FLIGHT: &str = "dialogue_limiter_in_flight";
    /// Current concurrency limit per host.
    pub const LIMIT: &str = "dialogue_limiter_limit";
    /// Entries waiting in the queue.
    pub const QUEUE_DEPTH: &str = "dialogue_queue_depth";
    /// Retry attempts.
    pub const RETRIES_TOTAL: &str = "dialogue_retries_total";
    /// Calls that spent their retry budget.
    pub const RETRIES_EXHAUSTED_TOTAL: &str = "dialogue_retries_exhausted_total";
    /// DNS lookups by outcome.
    pub const DNS_LOOKUPS_TOTAL: &str = "dialogue_dns_lookups_total";
    /// Hosts blacklisted.
    pub const BLACKLIST_TOTAL: &str = "dialogue_blacklist_total";
    /// Top-level calls by outcome.
    pub const REQUESTS_TOTAL: &str = "dialogue_requests_total";
    /// Top-level call latency.
    pub const REQUEST_DURATION: &str = "dialogue_request_duration_seconds";
}

impl ClientMetrics for MetricsClientMetrics {
    fn record_admission(&self, host: &str, admitted: bool) {
        let result = if admitted { "admitted" } else { "rejected" };
        metrics::counter!(
            metric_names::ADMISSIONS_TOTAL,
            "client" => self.client(),
            "host" => host.to_owned(),
            "result" => result,
        )
        .increment(1);
    }

    fn record_in_flight(&self, host: &str, in_flight: usize) {
        metrics::gauge!(metric_names::IN_FLIGHT, "client" => self.client(), "host" => host.to_owned())
            .set(in_flight as f64);
    }

    fn record_concurrency_limit(&self, host: &str, limit: f64) {
        metrics::gauge!(metric_names::LIMIT, "client" => self.client(), "host" => host.to_owned())
            .set(limit);
    }

    fn record_queue_depth(&self, depth: usize) {
        metrics::gauge!(metric_names::QUEUE_DEPTH, "client" => self.client()).set(depth as f64);
    }

    fn record_retry(&self, endpoint: &str, attempt: u32, error_type: &str) {
        metrics::counter!(
            metric_names::RETRIES_TOTAL,
            "client" => self.client(),
            "endpoint" => endpoint.to_owned(),
            "attempt" => attempt.to_string(),
            "error_type" => error_type.to_owned(),
        )
        .increment(1);
    }

    fn record_retries_exhausted(&self, endpoint: &str, _attempts: u32, error_type: &str) {
        metrics::counter!(
            metric_names::RETRIES_EXHAUSTED_TOTAL,
            "client" => self.client(),
            "endpoint" => endpoint.to_owned(),
            "error_type" => error_type.to_owned(),
        )
        .increment(1);
    }

    fn record_dns_lookup(&self, hostname: &str, outcome: DnsOutcome) {
        metrics::counter!(
            metric_names::DNS_LOOKUPS_TOTAL,
            "client" => self.client(),
            "hostname" => hostname.to_owned(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }

    fn record_blacklist(&self, host: &str, reason: &str) {
        metrics::counter!(
            metric_names::BLACKLIST_TOTAL,
            "client" => self.client(),
            "host" => host.to_owned(),
            "reason" => reason.to_owned(),
        )
        .increment(1);
    }

    fn record_request(&self, endpoint: &str, duration: Duration, success: bool) {
        let status = if success { "success" } else { "error" };
        metrics::counter!(
            metric_names::REQUESTS_TOTAL,
            "client" => self.client(),
            "endpoint" => endpoint.to_owned(),
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(
            metric_names::REQUEST_DURATION,
            "client" => self.client(),
            "endpoint" => endpoint.to_owned(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Creates the default metrics instance (no-op).
pub(crate) fn default_metrics() -> Arc<dyn ClientMetrics> {
    Arc::new(NoopClientMetrics)
}
