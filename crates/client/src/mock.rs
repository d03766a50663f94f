//! Scriptable test doubles for the pipeline's collaborators.
//!
//! These stand in for the transport, the resolver and the metrics backend so
//! that pipeline behavior can be exercised without sockets:
//!
//! - [`MockChannel`]: a host channel that plays back scripted outcomes
//! - [`MockHostChannelFactory`]: hands out one [`MockChannel`] per hostname
//! - [`ScriptedDnsResolver`]: plays back scripted lookup results
//! - [`CountingMetrics`]: counts the metric calls tests assert on
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dialogue_client::mock::{MockChannel, MockOutcome};
//! use dialogue_types::{Channel, Endpoint, Method, Request};
//!
//! # async fn example() {
//! let host = Arc::new(MockChannel::new("a.example.com"));
//! host.push(MockOutcome::ConnectError);
//! host.push(MockOutcome::Respond(200));
//!
//! let endpoint = Endpoint::parse("svc", "op", "1", Method::GET, "/op").unwrap();
//! assert!(host.execute(&endpoint, Request::default()).await.is_err());
//! assert!(host.execute(&endpoint, Request::default()).await.is_ok());
//! assert_eq!(host.invocations(), 2);
//! # }
//! ```

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dialogue_types::{
    CallError, Channel, Endpoint, HeaderMap, Request, Response, ResponseBody, ResponseFuture,
    StatusCode,
};
use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;

use crate::{
    dns::{DnsError, DnsResolver},
    host::{HostChannelFactory, TargetUri},
    metrics::{ClientMetrics, DnsOutcome},
};

/// Timeout reported by [`MockOutcome::Timeout`].
const MOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// One scripted result of a [`MockChannel`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    /// Respond immediately with this status code.
    Respond(u16),
    /// Fail with [`CallError::Connect`].
    ConnectError,
    /// Fail with [`CallError::Timeout`].
    Timeout,
    /// Never complete.
    Pending,
    /// Respond with the status code after the delay (tokio time).
    Delay(Duration, u16),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockOutcome>,
    endpoints: Vec<String>,
}

/// Host channel playing back scripted outcomes.
///
/// Each call consumes the next scripted [`MockOutcome`]; once the script is
/// empty calls respond `200`.
#[derive(Debug)]
pub struct MockChannel {
    name: String,
    state: Mutex<MockState>,
    invocations: AtomicUsize,
    cancellations: Arc<AtomicUsize>,
    closed_responses: Arc<AtomicUsize>,
}

impl MockChannel {
    /// Creates a channel named after the host it stands in for.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
            invocations: AtomicUsize::new(0),
            cancellations: Arc::new(AtomicUsize::new(0)),
            closed_responses: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Host name given at construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an outcome to the script.
    pub fn push(&self, outcome: MockOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    /// Number of calls made on this channel.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Acquire)
    }

    /// Number of calls dropped before they completed.
    #[must_use]
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::Acquire)
    }

    /// Number of responses from this channel that have been closed.
    #[must_use]
    pub fn closed_responses(&self) -> usize {
        self.closed_responses.load(Ordering::Acquire)
    }

    /// Endpoints called, in call order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.state.lock().endpoints.clone()
    }

    fn respond(&self, code: u16) -> Response {
        let closed = Arc::clone(&self.closed_responses);
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ResponseBody::empty().with_on_close(move || {
            closed.fetch_add(1, Ordering::AcqRel);
        });
        Response::new(status, HeaderMap::new(), body)
    }
}

/// Counts a call as cancelled if dropped while still armed.
struct CancelGuard {
    counter: Arc<AtomicUsize>,
    armed: bool,
}

impl CancelGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Channel for MockChannel {
    fn execute(&self, endpoint: &Endpoint, _request: Request) -> ResponseFuture {
        self.invocations.fetch_add(1, Ordering::AcqRel);
        let outcome = {
            let mut state = self.state.lock();
            state.endpoints.push(endpoint.to_string());
            state.script.pop_front().unwrap_or(MockOutcome::Respond(200))
        };
        let guard = CancelGuard { counter: Arc::clone(&self.cancellations), armed: true };
        let host = self.name.clone();

        let result: BoxFuture<'static, Result<Response, CallError>> = match outcome {
            MockOutcome::Respond(code) => futures::future::ready(Ok(self.respond(code))).boxed(),
            MockOutcome::ConnectError => futures::future::ready(Err(CallError::Connect {
                host,
                message: "connection refused".to_owned(),
            }))
            .boxed(),
            MockOutcome::Timeout => {
                futures::future::ready(Err(CallError::Timeout { host, timeout: MOCK_TIMEOUT })).boxed()
            },
            MockOutcome::Pending => futures::future::pending().boxed(),
            MockOutcome::Delay(delay, code) => {
                let response = self.respond(code);
                async move {
                    tokio::time::sleep(delay).await;
                    Ok(response)
                }
                .boxed()
            },
        };
        Box::pin(async move {
            let result = result.await;
            guard.disarm();
            result
        })
    }
}

/// Factory handing out one shared [`MockChannel`] per hostname.
///
/// Several upstreams of the same hostname (one per resolved address) share a
/// channel, and a hostname removed and re-added gets its old channel back.
#[derive(Debug, Default)]
pub struct MockHostChannelFactory {
    channels: Mutex<HashMap<String, Arc<MockChannel>>>,
    created: AtomicUsize,
}

impl MockHostChannelFactory {
    /// Creates a factory with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the pipeline asked for a host channel.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Channel for `hostname`, if one has been created.
    #[must_use]
    pub fn channel(&self, hostname: &str) -> Option<Arc<MockChannel>> {
        self.channels.lock().get(hostname).cloned()
    }

    /// Channel for `hostname`, creating it ahead of the pipeline so a test
    /// can script it before the first call.
    pub fn channel_or_create(&self, hostname: &str) -> Arc<MockChannel> {
        Arc::clone(
            self.channels
                .lock()
                .entry(hostname.to_owned())
                .or_insert_with(|| Arc::new(MockChannel::new(hostname))),
        )
    }
}

impl HostChannelFactory for MockHostChannelFactory {
    fn create(&self, target: &TargetUri, _address: Option<SocketAddr>) -> Arc<dyn Channel> {
        self.created.fetch_add(1, Ordering::AcqRel);
        self.channel_or_create(target.host())
    }
}

#[derive(Debug, Default)]
struct ScriptedHost {
    script: VecDeque<Result<Vec<IpAddr>, String>>,
    last: Option<Result<Vec<IpAddr>, String>>,
    lookups: usize,
}

/// Resolver playing back scripted results per hostname.
///
/// When a hostname's script runs out the last result repeats; a hostname
/// with no script resolves to no addresses.
#[derive(Debug, Default)]
pub struct ScriptedDnsResolver {
    hosts: Mutex<HashMap<String, ScriptedHost>>,
}

impl ScriptedDnsResolver {
    /// Creates a resolver with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result for `hostname`. `Err` carries the failure message.
    pub fn push(&self, hostname: &str, result: Result<Vec<IpAddr>, String>) {
        self.hosts.lock().entry(hostname.to_owned()).or_default().script.push_back(result);
    }

    /// Number of lookups made for `hostname`.
    #[must_use]
    pub fn lookups(&self, hostname: &str) -> usize {
        self.hosts.lock().get(hostname).map_or(0, |host| host.lookups)
    }
}

impl DnsResolver for ScriptedDnsResolver {
    fn resolve<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>> {
        let result = {
            let mut hosts = self.hosts.lock();
            let host = hosts.entry(hostname.to_owned()).or_default();
            host.lookups += 1;
            if let Some(next) = host.script.pop_front() {
                host.last = Some(next);
            }
            host.last.clone().unwrap_or_else(|| Ok(Vec::new()))
        };
        let result = result.map_err(|message| DnsError::Lookup { hostname: hostname.to_owned(), message });
        futures::future::ready(result).boxed()
    }
}

/// Metrics sink counting the calls tests assert on.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    retries: AtomicU64,
    exhausted_attempts: Mutex<Vec<u32>>,
    blacklists: AtomicU64,
    rejections: AtomicU64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
    max_queue_depth: AtomicUsize,
    dns: [AtomicU64; 4],
}

impl CountingMetrics {
    /// Retry attempts recorded.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    /// Attempt counts of calls that spent their retry budget, in order.
    #[must_use]
    pub fn exhausted_attempts(&self) -> Vec<u32> {
        self.exhausted_attempts.lock().clone()
    }

    /// Hosts blacklisted.
    #[must_use]
    pub fn blacklists(&self) -> u64 {
        self.blacklists.load(Ordering::Acquire)
    }

    /// Limiter rejections recorded.
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Acquire)
    }

    /// Top-level calls recorded.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    /// Top-level calls recorded as failed.
    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Acquire)
    }

    /// Largest queue depth reported.
    #[must_use]
    pub fn max_queue_depth(&self) -> usize {
        self.max_queue_depth.load(Ordering::Acquire)
    }

    /// DNS lookups recorded with `outcome`.
    #[must_use]
    pub fn dns_outcomes(&self, outcome: DnsOutcome) -> u64 {
        self.dns[dns_index(outcome)].load(Ordering::Acquire)
    }
}

fn dns_index(outcome: DnsOutcome) -> usize {
    match outcome {
        DnsOutcome::Success => 0,
        DnsOutcome::Failure => 1,
        DnsOutcome::Fallback => 2,
        DnsOutcome::Empty => 3,
    }
}

impl ClientMetrics for CountingMetrics {
    fn record_admission(&self, _host: &str, admitted: bool) {
        if !admitted {
            self.rejections.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn record_queue_depth(&self, depth: usize) {
        self.max_queue_depth.fetch_max(depth, Ordering::AcqRel);
    }

    fn record_retry(&self, _endpoint: &str, _attempt: u32, _error_type: &str) {
        self.retries.fetch_add(1, Ordering::AcqRel);
    }

    fn record_retries_exhausted(&self, _endpoint: &str, attempts: u32, _error_type: &str) {
        self.exhausted_attempts.lock().push(attempts);
    }

    fn record_dns_lookup(&self, _hostname: &str, outcome: DnsOutcome) {
        self.dns[dns_index(outcome)].fetch_add(1, Ordering::AcqRel);
    }

    fn record_blacklist(&self, _host: &str, _reason: &str) {
        self.blacklists.fetch_add(1, Ordering::AcqRel);
    }

    fn record_request(&self, _endpoint: &str, _duration: Duration, success: bool) {
        self.requests.fetch_add(1, Ordering::AcqRel);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::AcqRel);
        }
    }
}
