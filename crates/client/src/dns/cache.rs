//! Per-hostname DNS cache with last-known-good fallback.

use std::{collections::HashSet, fmt, net::IpAddr, sync::Arc, time::Instant};

use dashmap::DashMap;

use super::resolver::DnsError;
use crate::{
    clock::Clock,
    metrics::{ClientMetrics, DnsOutcome},
};

/// Cached state for one hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsCacheEntry {
    /// Addresses from the most recent lookup (empty if it failed).
    pub addresses: Vec<IpAddr>,
    /// When a lookup last returned addresses.
    pub last_success: Option<Instant>,
    /// Addresses from the last lookup that returned any.
    pub last_known_good: Vec<IpAddr>,
}

impl DnsCacheEntry {
    /// Addresses the pipeline should use: the fresh result if non-empty,
    /// otherwise the last-known-good one.
    #[must_use]
    pub fn effective(&self) -> &[IpAddr] {
        if self.addresses.is_empty() { &self.last_known_good } else { &self.addresses }
    }
}

/// DNS cache owned by one pipeline.
///
/// Never forgets a successful result because of a later failure: the
/// effective addresses for a hostname are empty only if no lookup for it has
/// ever succeeded.
pub struct DnsCache {
    entries: DashMap<String, DnsCacheEntry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
}

impl DnsCache {
    /// Creates an empty cache.
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<dyn ClientMetrics>) -> Self {
        Self { entries: DashMap::new(), clock, metrics }
    }

    /// Records a lookup result and returns the effective addresses.
    pub fn apply(&self, hostname: &str, result: Result<Vec<IpAddr>, DnsError>) -> Vec<IpAddr> {
        let mut entry = self.entries.entry(hostname.to_owned()).or_default();
        let outcome = match result {
            Ok(addresses) if !addresses.is_empty() => {
                entry.last_known_good.clone_from(&addresses);
                entry.addresses = addresses;
                entry.last_success = Some(self.clock.now());
                DnsOutcome::Success
            },
            Ok(_) => {
                entry.addresses.clear();
                if entry.last_known_good.is_empty() {
                    tracing::debug!(hostname, "DNS lookup returned no addresses");
                    DnsOutcome::Empty
                } else {
                    tracing::warn!(
                        hostname,
                        fallback = entry.last_known_good.len(),
                        "DNS lookup returned no addresses, using last known good"
                    );
                    DnsOutcome::Fallback
                }
            },
            Err(e) => {
                entry.addresses.clear();
                if entry.last_known_good.is_empty() {
                    tracing::warn!(hostname, error = %e, "DNS lookup failed");
                    DnsOutcome::Failure
                } else {
                    tracing::warn!(
                        hostname,
                        error = %e,
                        fallback = entry.last_known_good.len(),
                        "DNS lookup failed, using last known good"
                    );
                    DnsOutcome::Fallback
                }
            },
        };
        self.metrics.record_dns_lookup(hostname, outcome);
        entry.effective().to_vec()
    }

    /// Effective addresses for `hostname`, if it has ever been looked up.
    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<Vec<IpAddr>> {
        self.entries.get(hostname).map(|entry| entry.effective().to_vec())
    }

    /// Full cache entry for `hostname`.
    #[must_use]
    pub fn entry(&self, hostname: &str) -> Option<DnsCacheEntry> {
        self.entries.get(hostname).map(|entry| entry.clone())
    }

    /// Forgets hostnames that are no longer configured.
    pub fn retain(&self, hostnames: &HashSet<String>) {
        self.entries.retain(|hostname, _| hostnames.contains(hostname));
    }

    /// Number of cached hostnames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for DnsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCache").field("hostnames", &self.entries.len()).finish()
    }
}
