//! Per-host adaptive concurrency limiting.
//!
//! Each host gets an AIMD limiter:
//!
//! ```text
//!            ┌──── success within latency tolerance: limit += 1/limit ────┐
//!            │                                                            ▼
//!   min ◄────┴──── 429 / 503 / host failure: limit *= backoff_ratio ──── max
//! ```
//!
//! A call is admitted only while `in_flight < max(1, floor(limit))`. Both the
//! in-flight counter and the limit live in atomics updated with
//! compare-and-swap, so admission never takes a lock. Application errors and
//! cancellations leave the limit unchanged.
//!
//! The invariant is enforced at admission: a shrinking limit never aborts
//! calls already in flight, it only stops new ones until the host drains.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use dialogue_types::{Channel, Endpoint, LimitedChannel, Request, ResponseFuture};

use crate::{
    clock::Clock, config::ConcurrencyLimitConfig, metrics::ClientMetrics, outcome::CallOutcome,
};

/// Window after which the observed minimum latency is forgotten.
const MIN_LATENCY_WINDOW: Duration = Duration::from_secs(60);

/// Sentinel for "no latency observed in the current window".
const NO_LATENCY: u64 = u64::MAX;

/// Adaptive concurrency limiter for one host.
pub struct ConcurrencyLimiter {
    host: Arc<str>,
    config: ArcSwap<ConcurrencyLimitConfig>,
    /// `f64` limit stored as raw bits.
    limit_bits: AtomicU64,
    in_flight: AtomicUsize,
    min_latency_nanos: AtomicU64,
    /// Start of the current minimum-latency window, as nanos since `epoch`.
    window_start_nanos: AtomicU64,
    epoch: Instant,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter starting at `config.initial_limit`.
    pub fn new(
        host: impl Into<Arc<str>>,
        config: ConcurrencyLimitConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            host: host.into(),
            limit_bits: AtomicU64::new(config.initial_limit.to_bits()),
            config: ArcSwap::from_pointee(config),
            in_flight: AtomicUsize::new(0),
            min_latency_nanos: AtomicU64::new(NO_LATENCY),
            window_start_nanos: AtomicU64::new(0),
            epoch,
            clock,
            metrics,
        }
    }

    /// Current (fractional) limit.
    #[must_use]
    pub fn limit(&self) -> f64 {
        f64::from_bits(self.limit_bits.load(Ordering::Acquire))
    }

    /// Number of calls admitted and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns true if another call would be admitted right now.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.admission_limit()
    }

    /// Minimum latency observed in the current window.
    #[must_use]
    pub fn min_latency(&self) -> Option<Duration> {
        match self.min_latency_nanos.load(Ordering::Acquire) {
            NO_LATENCY => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Replaces the configuration, clamping the current limit into the new
    /// bounds.
    pub fn set_config(&self, config: ConcurrencyLimitConfig) {
        let (min, max) = (config.min_limit, config.max_limit);
        self.config.store(Arc::new(config));
        let limit = self.update_limit(|limit| limit.clamp(min, max));
        self.metrics.record_concurrency_limit(&self.host, limit);
    }

    /// Claims a slot if the host is under its limit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<LimiterPermit> {
        let limit = self.admission_limit();
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= limit {
                self.metrics.record_admission(&self.host, false);
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.metrics.record_admission(&self.host, true);
        self.metrics.record_in_flight(&self.host, current + 1);
        Some(LimiterPermit { limiter: Arc::clone(self), started: self.clock.now() })
    }

    fn admission_limit(&self) -> usize {
        (self.limit().floor() as usize).max(1)
    }

    fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.metrics.record_in_flight(&self.host, previous.saturating_sub(1));
    }

    fn on_outcome(&self, outcome: CallOutcome, latency: Duration) {
        let config = self.config.load();
        let next = match outcome {
            CallOutcome::Success => {
                let min_latency = self.observe_latency(latency);
                let tolerated = min_latency.mul_f64(config.latency_tolerance);
                if latency > tolerated {
                    return;
                }
                let max = config.max_limit;
                self.update_limit(|limit| (limit + 1.0 / limit).min(max))
            },
            CallOutcome::Overloaded | CallOutcome::HostFailure => {
                let (ratio, min) = (config.backoff_ratio, config.min_limit);
                let next = self.update_limit(|limit| (limit * ratio).max(min));
                tracing::debug!(host = %self.host, limit = next, ?outcome, "concurrency limit reduced");
                next
            },
            CallOutcome::ServerError | CallOutcome::Ignored => return,
        };
        self.metrics.record_concurrency_limit(&self.host, next);
    }

    /// Folds a sample into the windowed minimum and returns the minimum.
    fn observe_latency(&self, latency: Duration) -> Duration {
        let sample = u64::try_from(latency.as_nanos()).unwrap_or(NO_LATENCY - 1);
        let now = u64::try_from(self.clock.now().saturating_duration_since(self.epoch).as_nanos())
            .unwrap_or(u64::MAX);
        let window_start = self.window_start_nanos.load(Ordering::Acquire);
        let window = u64::try_from(MIN_LATENCY_WINDOW.as_nanos()).unwrap_or(u64::MAX);
        if now.saturating_sub(window_start) > window
            && self
                .window_start_nanos
                .compare_exchange(window_start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.min_latency_nanos.store(sample, Ordering::Release);
            return latency;
        }
        let previous = self.min_latency_nanos.fetch_min(sample, Ordering::AcqRel);
        Duration::from_nanos(previous.min(sample))
    }

    fn update_limit(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut bits = self.limit_bits.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(bits));
            match self.limit_bits.compare_exchange_weak(
                bits,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => bits = actual,
            }
        }
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("host", &self.host)
            .field("limit", &self.limit())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A claimed limiter slot.
///
/// Dropping the permit without [`complete`](Self::complete) releases the slot
/// and leaves the limit unchanged, which is how cancellation is treated.
#[derive(Debug)]
pub struct LimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
    started: Instant,
}

impl LimiterPermit {
    /// Releases the slot and adjusts the limit for the call's outcome.
    pub(crate) fn complete(self, outcome: CallOutcome) {
        let latency = self.limiter.clock.now().saturating_duration_since(self.started);
        self.limiter.on_outcome(outcome, latency);
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// [`LimitedChannel`] that admits calls to one host through its limiter.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimitedChannel {
    delegate: Arc<dyn Channel>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl ConcurrencyLimitedChannel {
    /// Wraps a host channel.
    pub fn new(delegate: Arc<dyn Channel>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self { delegate, limiter }
    }

    /// The limiter guarding this channel.
    #[must_use]
    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }
}

impl LimitedChannel for ConcurrencyLimitedChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        let permit = self.limiter.try_acquire()?;
        let call = self.delegate.execute(endpoint, request.clone());
        Some(Box::pin(async move {
            let result = call.await;
            permit.complete(CallOutcome::classify(&result));
            result
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use dialogue_types::Method;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        clock::ManualClock,
        metrics::NoopClientMetrics,
        mock::{MockChannel, MockOutcome},
    };

    fn limiter_with(config: ConcurrencyLimitConfig, clock: &ManualClock) -> Arc<ConcurrencyLimiter> {
        Arc::new(ConcurrencyLimiter::new(
            "https://a.example.com:443",
            config,
            Arc::new(clock.clone()),
            Arc::new(NoopClientMetrics),
        ))
    }

    fn config(initial: f64, min: f64, max: f64) -> ConcurrencyLimitConfig {
        ConcurrencyLimitConfig::builder()
            .initial_limit(initial)
            .min_limit(min)
            .max_limit(max)
            .backoff_ratio(0.5)
            .build()
            .unwrap()
    }

    #[test]
    fn test_admits_up_to_floor_of_limit() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(2.7, 1.0, 10.0), &clock);

        let a = limiter.try_acquire().unwrap();
        let b = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.in_flight(), 2);

        drop(a);
        assert!(limiter.has_capacity());
        drop(b);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_success_grows_additively() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(4.0, 1.0, 10.0), &clock);

        let permit = limiter.try_acquire().unwrap();
        clock.advance(Duration::from_millis(10));
        permit.complete(CallOutcome::Success);
        assert!((limiter.limit() - 4.25).abs() < 1e-9);
        assert_eq!(limiter.min_latency(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_slow_success_does_not_grow() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(4.0, 1.0, 10.0), &clock);

        let fast = limiter.try_acquire().unwrap();
        clock.advance(Duration::from_millis(10));
        fast.complete(CallOutcome::Success);
        let grown = limiter.limit();

        let slow = limiter.try_acquire().unwrap();
        clock.advance(Duration::from_millis(100));
        slow.complete(CallOutcome::Success);
        assert_eq!(limiter.limit(), grown);
    }

    #[test]
    fn test_growth_capped_at_max() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(2.0, 1.0, 2.0), &clock);
        for _ in 0..5 {
            limiter.try_acquire().unwrap().complete(CallOutcome::Success);
        }
        assert_eq!(limiter.limit(), 2.0);
    }

    #[test]
    fn test_overload_and_failure_shrink_to_min() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(8.0, 2.0, 10.0), &clock);

        limiter.try_acquire().unwrap().complete(CallOutcome::Overloaded);
        assert_eq!(limiter.limit(), 4.0);
        limiter.try_acquire().unwrap().complete(CallOutcome::HostFailure);
        assert_eq!(limiter.limit(), 2.0);
        limiter.try_acquire().unwrap().complete(CallOutcome::HostFailure);
        assert_eq!(limiter.limit(), 2.0);
    }

    #[test]
    fn test_application_errors_and_cancellation_leave_limit() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(8.0, 1.0, 10.0), &clock);

        limiter.try_acquire().unwrap().complete(CallOutcome::ServerError);
        limiter.try_acquire().unwrap().complete(CallOutcome::Ignored);
        drop(limiter.try_acquire().unwrap());
        assert_eq!(limiter.limit(), 8.0);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[test]
    fn test_shrink_below_in_flight_drains() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(4.0, 1.0, 10.0), &clock);
        let held: Vec<_> = (0..4).map(|_| limiter.try_acquire().unwrap()).collect();
        assert!(limiter.try_acquire().is_none());

        let mut iter = held.into_iter();
        iter.next().unwrap().complete(CallOutcome::Overloaded);

        // limit 2.0 with three still in flight: nothing new until two finish.
        assert_eq!(limiter.limit(), 2.0);
        assert!(limiter.try_acquire().is_none());
        drop(iter.next());
        assert!(limiter.try_acquire().is_none());
        drop(iter.next());
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_set_config_clamps_limit() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(8.0, 1.0, 10.0), &clock);
        limiter.set_config(config(3.0, 1.0, 3.0));
        assert_eq!(limiter.limit(), 3.0);
    }

    #[tokio::test]
    async fn test_limited_channel_rejects_when_full() {
        let clock = ManualClock::new();
        let limiter = limiter_with(config(1.0, 1.0, 1.0), &clock);
        let mock = Arc::new(MockChannel::new("a"));
        mock.push(MockOutcome::Pending);
        let channel = ConcurrencyLimitedChannel::new(mock.clone(), Arc::clone(&limiter));
        let endpoint = Endpoint::parse("svc", "op", "1", Method::GET, "/op").unwrap();

        let first = channel.maybe_execute(&endpoint, &Request::default()).unwrap();
        assert!(channel.maybe_execute(&endpoint, &Request::default()).is_none());
        assert_eq!(mock.invocations(), 1);

        drop(first);
        assert_eq!(limiter.in_flight(), 0);
        mock.push(MockOutcome::Respond(200));
        let response = channel.maybe_execute(&endpoint, &Request::default()).unwrap().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Complete(u8),
        Drop,
        Advance(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Acquire),
            2 => (0u8..4).prop_map(Op::Complete),
            1 => Just(Op::Drop),
            1 => (0u16..500).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn prop_admission_never_exceeds_limit(ops in proptest::collection::vec(op(), 1..200)) {
            let clock = ManualClock::new();
            let cfg = config(5.0, 1.0, 20.0);
            let limiter = limiter_with(cfg.clone(), &clock);
            let mut held = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => {
                        let floor = (limiter.limit().floor() as usize).max(1);
                        let before = limiter.in_flight();
                        match limiter.try_acquire() {
                            Some(permit) => {
                                prop_assert!(before < floor);
                                prop_assert!(limiter.in_flight() <= floor);
                                held.push(permit);
                            },
                            None => prop_assert!(before >= floor),
                        }
                    },
                    Op::Complete(kind) => {
                        if let Some(permit) = held.pop() {
                            let outcome = match kind {
                                0 => CallOutcome::Success,
                                1 => CallOutcome::Overloaded,
                                2 => CallOutcome::HostFailure,
                                _ => CallOutcome::ServerError,
                            };
                            permit.complete(outcome);
                        }
                    },
                    Op::Drop => {
                        held.pop();
                    },
                    Op::Advance(ms) => clock.advance(Duration::from_millis(u64::from(ms))),
                }
                prop_assert_eq!(limiter.in_flight(), held.len());
                prop_assert!(limiter.limit() >= cfg.min_limit);
                prop_assert!(limiter.limit() <= cfg.max_limit);
            }
        }
    }
}
