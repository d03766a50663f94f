//! Temporary exclusion of failing hosts.
//!
//! ```text
//! ┌───────────┐  host failure, or N consecutive   ┌─────────────┐
//! │ Available ├──────────── overloads ───────────►│ Blacklisted │
//! └─────▲─────┘                                   └──────┬──────┘
//!       │          now >= until (checked on read)        │
//!       └────────────────────────────────────────────────┘
//! ```
//!
//! A host is blacklisted until `now + cooldown * (1 + jitter)`, with jitter
//! uniform in `[0, cooldown_jitter]`. Entries are never removed by a timer:
//! they expire passively when read. The entry map is copy-on-write
//! (`ArcSwap<HashMap>`) so readers on the call path never lock.
//!
//! Once the host set is known, results for hosts outside it are dropped, so a
//! call that outlives its host cannot leave an entry behind.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Instant,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::DashMap;
use dialogue_types::{Endpoint, LimitedChannel, Request, ResponseFuture};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    clock::Clock, config::BlacklistConfig, host::HostId, limiter::ConcurrencyLimitedChannel,
    metrics::ClientMetrics, outcome::CallOutcome,
};

/// Why a host was blacklisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistReason {
    /// Connect, I/O or timeout failure.
    HostFailure,
    /// Repeated 429/503 responses.
    Overloaded,
}

impl fmt::Display for BlacklistReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostFailure => write!(f, "host_failure"),
            Self::Overloaded => write!(f, "overloaded"),
        }
    }
}

/// A host's blacklist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistEntry {
    /// Instant at which the host becomes selectable again.
    pub until: Instant,
    /// What triggered the entry.
    pub reason: BlacklistReason,
}

/// Blacklist shared by every host of one pipeline.
pub struct Blacklist {
    entries: ArcSwap<HashMap<HostId, BlacklistEntry>>,
    /// Live hosts from the last [`Blacklist::retain_hosts`]; `None` until then.
    members: ArcSwapOption<HashSet<HostId>>,
    consecutive_overloads: DashMap<HostId, u32>,
    config: ArcSwap<BlacklistConfig>,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
}

impl Blacklist {
    /// Creates an empty blacklist. `seed` makes cooldown jitter reproducible.
    pub fn new(
        config: BlacklistConfig,
        seed: Option<u64>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn ClientMetrics>,
    ) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            members: ArcSwapOption::empty(),
            consecutive_overloads: DashMap::new(),
            config: ArcSwap::from_pointee(config),
            rng: Mutex::new(rng),
            clock,
            metrics,
        }
    }

    /// Returns the active entry for `host`, ignoring expired ones.
    #[must_use]
    pub fn entry(&self, host: &HostId) -> Option<BlacklistEntry> {
        let now = self.clock.now();
        self.entries.load().get(host).filter(|entry| entry.until > now).copied()
    }

    /// Returns true while `host` is excluded from selection.
    #[must_use]
    pub fn is_blacklisted(&self, host: &HostId) -> bool {
        self.entry(host).is_some()
    }

    /// Number of hosts currently excluded.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.entries.load().values().filter(|entry| entry.until > now).count()
    }

    /// Replaces the configuration. Existing entries keep their expiry.
    pub fn set_config(&self, config: BlacklistConfig) {
        self.config.store(Arc::new(config));
    }

    fn is_member(&self, host: &HostId) -> bool {
        self.members.load().as_deref().is_none_or(|hosts| hosts.contains(host))
    }

    /// Excludes `host` for one jittered cooldown and returns the expiry, or
    /// `None` if the host is no longer part of the host set.
    pub fn blacklist(&self, host: &HostId, reason: BlacklistReason) -> Option<Instant> {
        let config = self.config.load();
        let jitter = if config.cooldown_jitter > 0.0 {
            self.rng.lock().random_range(0.0..=config.cooldown_jitter)
        } else {
            0.0
        };
        let cooldown = config.cooldown.mul_f64(1.0 + jitter);
        let until = self.clock.now() + cooldown;
        let entry = BlacklistEntry { until, reason };

        // Membership is read inside the rcu closure: a concurrent retain_hosts
        // swaps the map, which forces a retry against the new host set.
        let mut inserted = false;
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            inserted = self.is_member(host);
            if inserted {
                next.insert(host.clone(), entry);
            }
            next
        });
        if !inserted {
            tracing::trace!(host = %host, "ignoring result for removed host");
            return None;
        }

        tracing::warn!(
            host = %host,
            reason = %reason,
            cooldown_ms = cooldown.as_millis() as u64,
            "host blacklisted"
        );
        self.metrics.record_blacklist(host.as_str(), &reason.to_string());
        Some(until)
    }

    /// Updates the host's state from a finished call.
    pub(crate) fn record(&self, host: &HostId, outcome: CallOutcome) {
        if !self.is_member(host) {
            return;
        }
        match outcome {
            CallOutcome::Success | CallOutcome::ServerError => {
                self.consecutive_overloads.remove(host);
            },
            CallOutcome::Overloaded => {
                let threshold = self.config.load().overload_threshold;
                let tripped = {
                    let mut count = self.consecutive_overloads.entry(host.clone()).or_insert(0);
                    *count += 1;
                    if *count >= threshold {
                        *count = 0;
                        true
                    } else {
                        false
                    }
                };
                if tripped {
                    self.blacklist(host, BlacklistReason::Overloaded);
                }
            },
            CallOutcome::HostFailure => {
                self.consecutive_overloads.remove(host);
                self.blacklist(host, BlacklistReason::HostFailure);
            },
            CallOutcome::Ignored => {},
        }
    }

    /// Drops state for hosts not in `hosts`, along with expired entries.
    /// Later results for hosts outside `hosts` are ignored.
    pub fn retain_hosts(&self, hosts: &HashSet<HostId>) {
        self.members.store(Some(Arc::new(hosts.clone())));
        let now = self.clock.now();
        // Always swap, even when nothing is stale, so an in-flight rcu in
        // `blacklist` re-reads the new membership.
        self.entries.rcu(|current| {
            current
                .iter()
                .filter(|(host, entry)| hosts.contains(*host) && entry.until > now)
                .map(|(host, entry)| (host.clone(), *entry))
                .collect::<HashMap<_, _>>()
        });
        self.consecutive_overloads.retain(|host, _| hosts.contains(host));
    }

    /// Removes every entry and counter.
    pub fn clear(&self) {
        self.entries.store(Arc::new(HashMap::new()));
        self.consecutive_overloads.clear();
    }
}

impl fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blacklist").field("active", &self.active_count()).finish()
    }
}

/// [`LimitedChannel`] that refuses calls while its host is blacklisted and
/// feeds every result back into the blacklist.
#[derive(Debug, Clone)]
pub struct BlacklistingChannel {
    host: HostId,
    delegate: ConcurrencyLimitedChannel,
    blacklist: Arc<Blacklist>,
}

impl BlacklistingChannel {
    /// Wraps a host's limited channel.
    pub fn new(host: HostId, delegate: ConcurrencyLimitedChannel, blacklist: Arc<Blacklist>) -> Self {
        Self { host, delegate, blacklist }
    }

    /// The wrapped limited channel.
    #[must_use]
    pub fn delegate(&self) -> &ConcurrencyLimitedChannel {
        &self.delegate
    }

    /// Returns true while the host is excluded.
    #[must_use]
    pub fn is_blacklisted(&self) -> bool {
        self.blacklist.is_blacklisted(&self.host)
    }
}

impl LimitedChannel for BlacklistingChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        if self.is_blacklisted() {
            tracing::trace!(host = %self.host, "skipping blacklisted host");
            return None;
        }
        let call = self.delegate.maybe_execute(endpoint, request)?;
        let host = self.host.clone();
        let blacklist = Arc::clone(&self.blacklist);
        Some(Box::pin(async move {
            let result = call.await;
            blacklist.record(&host, CallOutcome::classify(&result));
            result
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use std::time::Duration;

    use dialogue_types::Method;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::ConcurrencyLimitConfig,
        limiter::ConcurrencyLimiter,
        metrics::NoopClientMetrics,
        mock::{CountingMetrics, MockChannel, MockOutcome},
    };

    fn test_config() -> BlacklistConfig {
        BlacklistConfig::builder()
            .cooldown(Duration::from_secs(10))
            .cooldown_jitter(0.0)
            .overload_threshold(2)
            .build()
            .unwrap()
    }

    fn blacklist(clock: &ManualClock) -> Blacklist {
        Blacklist::new(test_config(), Some(7), Arc::new(clock.clone()), Arc::new(NoopClientMetrics))
    }

    #[test]
    fn test_host_failure_blacklists_until_cooldown() {
        let clock = ManualClock::new();
        let list = blacklist(&clock);
        let host = HostId::new("https://a.example.com:443");

        list.record(&host, CallOutcome::HostFailure);
        let entry = list.entry(&host).unwrap();
        assert_eq!(entry.reason, BlacklistReason::HostFailure);

        clock.advance(Duration::from_secs(9));
        assert!(list.is_blacklisted(&host));
        clock.advance(Duration::from_secs(1));
        assert!(!list.is_blacklisted(&host));
    }

    #[test]
    fn test_overloads_blacklist_after_threshold() {
        let clock = ManualClock::new();
        let list = blacklist(&clock);
        let host = HostId::new("a");

        list.record(&host, CallOutcome::Overloaded);
        assert!(!list.is_blacklisted(&host));
        list.record(&host, CallOutcome::Overloaded);
        assert_eq!(list.entry(&host).unwrap().reason, BlacklistReason::Overloaded);
    }

    #[test]
    fn test_success_resets_overload_counter() {
        let clock = ManualClock::new();
        let list = blacklist(&clock);
        let host = HostId::new("a");

        list.record(&host, CallOutcome::Overloaded);
        list.record(&host, CallOutcome::Success);
        list.record(&host, CallOutcome::Overloaded);
        assert!(!list.is_blacklisted(&host));
    }

    #[test]
    fn test_ignored_outcomes_do_nothing() {
        let clock = ManualClock::new();
        let list = blacklist(&clock);
        let host = HostId::new("a");
        list.record(&host, CallOutcome::Ignored);
        list.record(&host, CallOutcome::ServerError);
        assert_eq!(list.active_count(), 0);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let clock = ManualClock::new();
        let config = BlacklistConfig::builder()
            .cooldown(Duration::from_secs(10))
            .cooldown_jitter(0.5)
            .build()
            .unwrap();
        let list = Blacklist::new(config, Some(1), Arc::new(clock.clone()), Arc::new(NoopClientMetrics));
        let now = clock.now();
        for i in 0..50 {
            let until =
                list.blacklist(&HostId::new(format!("h{i}")), BlacklistReason::HostFailure).unwrap();
            let cooldown = until - now;
            assert!(cooldown >= Duration::from_secs(10));
            assert!(cooldown <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_retain_hosts_prunes_removed_and_expired() {
        let clock = ManualClock::new();
        let list = blacklist(&clock);
        let (a, b) = (HostId::new("a"), HostId::new("b"));
        list.blacklist(&a, BlacklistReason::HostFailure);
        list.blacklist(&b, BlacklistReason::HostFailure);

        list.retain_hosts(&[a.clone()].into_iter().collect());
        assert!(list.is_blacklisted(&a));
        assert!(!list.is_blacklisted(&b));

        clock.advance(Duration::from_secs(11));
        list.retain_hosts(&[a.clone()].into_iter().collect());
        assert_eq!(list.entries.load().len(), 0);
    }

    #[test]
    fn test_result_for_removed_host_leaves_no_state() {
        let clock = ManualClock::new();
        let metrics = Arc::new(CountingMetrics::default());
        let list = Blacklist::new(test_config(), Some(7), Arc::new(clock.clone()), metrics.clone());
        let (a, b) = (HostId::new("a"), HostId::new("b"));
        list.retain_hosts(&[a.clone(), b.clone()].into_iter().collect());

        // `a` is removed while its call is still running.
        list.retain_hosts(&[b.clone()].into_iter().collect());
        list.record(&a, CallOutcome::HostFailure);
        list.record(&a, CallOutcome::Overloaded);

        assert!(!list.is_blacklisted(&a));
        assert!(list.entries.load().is_empty());
        assert!(list.consecutive_overloads.is_empty());
        assert_eq!(list.blacklist(&a, BlacklistReason::HostFailure), None);
        assert_eq!(metrics.blacklists(), 0);

        list.record(&b, CallOutcome::HostFailure);
        assert!(list.is_blacklisted(&b));
    }

    #[tokio::test]
    async fn test_blacklisting_channel_refuses_while_blacklisted() {
        let clock = ManualClock::new();
        let metrics = Arc::new(CountingMetrics::default());
        let list = Arc::new(Blacklist::new(
            test_config(),
            Some(7),
            Arc::new(clock.clone()),
            metrics.clone(),
        ));
        let mock = Arc::new(MockChannel::new("a"));
        let limiter = Arc::new(ConcurrencyLimiter::new(
            "a",
            ConcurrencyLimitConfig::default(),
            Arc::new(clock.clone()),
            metrics.clone(),
        ));
        let host = HostId::new("a");
        let channel = BlacklistingChannel::new(
            host.clone(),
            ConcurrencyLimitedChannel::new(mock.clone(), limiter),
            Arc::clone(&list),
        );
        let endpoint = Endpoint::parse("svc", "op", "1", Method::GET, "/op").unwrap();

        mock.push(MockOutcome::ConnectError);
        let result = channel.maybe_execute(&endpoint, &Request::default()).unwrap().await;
        assert!(result.is_err());
        assert!(channel.is_blacklisted());
        assert_eq!(metrics.blacklists(), 1);

        assert!(channel.maybe_execute(&endpoint, &Request::default()).is_none());
        assert_eq!(mock.invocations(), 1);

        clock.advance(Duration::from_secs(10));
        mock.push(MockOutcome::Respond(200));
        let response = channel.maybe_execute(&endpoint, &Request::default()).unwrap().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(mock.invocations(), 2);
    }
}
