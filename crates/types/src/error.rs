//! Call failure taxonomy.
//!
//! Every stage of the pipeline either handles a failure and forwards it
//! unchanged, or fails fast with one of the local-rejection variants:
//! - **Local rejection**: queue full, no hosts available
//! - **Host-level transient failure**: connect, I/O and timeout errors
//! - **Cancellation**: the pipeline closed while the call was waiting
//!
//! Overload signals (HTTP 429/503) and application errors are not errors at
//! this level: they arrive as ordinary [`Response`](crate::Response)s and are
//! classified by status code.

use std::time::Duration;

use snafu::Snafu;

/// Result type alias for pipeline calls.
pub type Result<T, E = CallError> = std::result::Result<T, E>;

/// Errors surfaced by a channel call.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CallError {
    /// The queue is at capacity; the call was rejected without being queued.
    #[snafu(display("Queue full: {capacity} requests already waiting"))]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// No upstream host is configured for the service.
    #[snafu(display("No hosts available for service {service}"))]
    NoHostsAvailable {
        /// Service name of the endpoint being called.
        service: String,
    },

    /// Failed to establish a connection to the host.
    #[snafu(display("Connection to {host} failed: {message}"))]
    Connect {
        /// Host identity.
        host: String,
        /// Error description from the transport.
        message: String,
    },

    /// I/O error while the call was in flight.
    #[snafu(display("I/O error talking to {host}: {source}"))]
    Io {
        /// Host identity.
        host: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The transport gave up waiting for the host.
    #[snafu(display("Call to {host} timed out after {}ms", timeout.as_millis()))]
    Timeout {
        /// Host identity.
        host: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The request cannot be sent as built.
    #[snafu(display("Invalid request: {message}"))]
    InvalidRequest {
        /// Error description.
        message: String,
    },

    /// The pipeline was closed before the call could be dispatched.
    #[snafu(display("Call cancelled"))]
    Cancelled,
}

impl CallError {
    /// Returns true if the failure is transient and the call may be retried.
    ///
    /// Retryable errors:
    /// - `Connect`: host unreachable or handshake failed
    /// - `Io`: connection broke mid-call
    /// - `Timeout`: treated exactly like a connection failure
    ///
    /// Local rejections, invalid requests and cancellation are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Io { .. } | Self::Timeout { .. } => true,
            Self::QueueFull { .. }
            | Self::NoHostsAvailable { .. }
            | Self::InvalidRequest { .. }
            | Self::Cancelled => false,
        }
    }

    /// Returns true if the failure is attributable to the host itself.
    ///
    /// Host failures shrink the host's concurrency limit and blacklist it.
    #[must_use]
    pub fn is_host_failure(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Io { .. } | Self::Timeout { .. })
    }

    /// Returns true if this is a local rejection produced by the pipeline.
    #[must_use]
    pub fn is_local_rejection(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::NoHostsAvailable { .. })
    }

    /// Returns a static label for metrics.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::NoHostsAvailable { .. } => "no_hosts",
            Self::Connect { .. } => "connect",
            Self::Io { .. } => "io",
            Self::Timeout { .. } => "timeout",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Cancelled => "cancelled",
        }
    }
}
