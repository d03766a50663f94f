//! Load- and failure-aware host selection.
//!
//! Each host is scored as:
//!
//! ```text
//! score = in_flight + penalty * 0.5^(elapsed / half_life) + jitter[0, 1)
//! ```
//!
//! where `in_flight` comes from the host's limiter and `penalty` accumulates
//! on 429/503 responses and host failures. Hosts are tried in ascending score
//! order until one admits the call.
//!
//! Penalties are only kept for hosts of the latest snapshot: a call that
//! completes after its host was removed records nothing.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use dialogue_types::{Endpoint, LimitedChannel, Request, ResponseFuture};
use parking_lot::Mutex;
use rand::{Rng, rngs::StdRng};

use crate::{
    clock::Clock,
    config::NodeSelectionConfig,
    host::{HostId, HostSnapshot, Upstream},
    outcome::CallOutcome,
};

/// Decaying failure penalty for one host.
#[derive(Debug, Clone, Copy)]
struct Penalty {
    value: f64,
    updated: Instant,
}

impl Penalty {
    fn decayed(&self, now: Instant, half_life: Duration) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.value * 0.5f64.powf(elapsed / half_life.as_secs_f64())
    }
}

#[derive(Debug)]
pub(crate) struct BalancedSelector {
    penalties: Arc<DashMap<HostId, Penalty>>,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
    seen_version: AtomicU64,
}

impl BalancedSelector {
    pub(crate) fn new(rng: StdRng, clock: Arc<dyn Clock>) -> Self {
        Self {
            penalties: Arc::new(DashMap::new()),
            rng: Mutex::new(rng),
            clock,
            seen_version: AtomicU64::new(u64::MAX),
        }
    }

    /// Scores every host, lowest first.
    fn ranked(&self, snapshot: &HostSnapshot, config: &NodeSelectionConfig) -> Vec<Arc<Upstream>> {
        let now = self.clock.now();
        let mut scored: Vec<(f64, Arc<Upstream>)> = {
            let mut rng = self.rng.lock();
            snapshot
                .hosts()
                .iter()
                .map(|host| {
                    let penalty = self
                        .penalties
                        .get(host.id())
                        .map_or(0.0, |p| p.decayed(now, config.failure_half_life));
                    let jitter: f64 = rng.random();
                    (host.limiter().in_flight() as f64 + penalty + jitter, Arc::clone(host))
                })
                .collect()
        };
        scored.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        scored.into_iter().map(|(_, host)| host).collect()
    }

    pub(crate) fn select(
        &self,
        snapshot: &HostSnapshot,
        config: &NodeSelectionConfig,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<ResponseFuture> {
        self.prune(snapshot);
        self.ranked(snapshot, config)
            .into_iter()
            .find_map(|host| self.execute_on(&host, config, endpoint, request))
    }

    /// Runs the call on one host, tracking its outcome.
    pub(crate) fn execute_on(
        &self,
        host: &Upstream,
        config: &NodeSelectionConfig,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<ResponseFuture> {
        let call = host.maybe_execute(endpoint, request)?;
        tracing::debug!(host = %host.id(), endpoint = %endpoint, "balanced selection");
        let penalties = Arc::clone(&self.penalties);
        let clock = Arc::clone(&self.clock);
        let id = host.id().clone();
        let (half_life, overload, failure) =
            (config.failure_half_life, config.overload_penalty, config.failure_penalty);
        Some(Box::pin(async move {
            let result = call.await;
            let added = match CallOutcome::classify(&result) {
                CallOutcome::Overloaded => overload,
                CallOutcome::HostFailure => failure,
                _ => return result,
            };
            let now = clock.now();
            if let Some(mut penalty) = penalties.get_mut(&id) {
                let value = penalty.decayed(now, half_life) + added;
                *penalty = Penalty { value, updated: now };
            }
            result
        }))
    }

    /// Tracks exactly the snapshot's hosts once per snapshot version.
    pub(crate) fn prune(&self, snapshot: &HostSnapshot) {
        let version = snapshot.version();
        if self.seen_version.swap(version, Ordering::AcqRel) != version {
            let ids: HashSet<HostId> = snapshot.ids();
            self.penalties.retain(|id, _| ids.contains(id));
            let now = self.clock.now();
            for id in ids {
                self.penalties.entry(id).or_insert(Penalty { value: 0.0, updated: now });
            }
        }
    }

    #[cfg(test)]
    fn penalty(&self, id: &HostId, config: &NodeSelectionConfig) -> f64 {
        let now = self.clock.now();
        self.penalties.get(id).map_or(0.0, |p| p.decayed(now, config.failure_half_life))
    }
}
