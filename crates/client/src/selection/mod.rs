//! Node selection across the live host set.
//!
//! [`NodeSelectionChannel`] owns one selector per client. The selector type is
//! fixed by [`NodeSelectionStrategy`] and only replaced when a live config
//! update changes the strategy; membership changes never reset it.

mod balanced;
mod pin;

use std::{fmt, sync::Arc};

use dialogue_types::{CallError, Endpoint, LimitedChannel, Request, ResponseFuture};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};

use self::{balanced::BalancedSelector, pin::PinUntilErrorSelector};
use crate::{
    clock::Clock,
    config::{NodeSelectionConfig, NodeSelectionStrategy},
    host::{HostId, HostSet},
};

/// Request attachment routing a call to one specific host.
///
/// Used for sticky sessions: a caller that learned a host id from an earlier
/// call can attach it so follow-up calls land on the same host. If the host
/// is no longer part of the host set the hint is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostHint(pub HostId);

#[derive(Debug)]
enum Selector {
    Balanced(BalancedSelector),
    Pin(PinUntilErrorSelector),
}

impl Selector {
    fn new(config: &NodeSelectionConfig, clock: Arc<dyn Clock>) -> Self {
        let rng = config.seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        match config.strategy {
            NodeSelectionStrategy::Balanced => Self::Balanced(BalancedSelector::new(rng, clock)),
            NodeSelectionStrategy::PinUntilError => {
                Self::Pin(PinUntilErrorSelector::new(rng, clock, true))
            },
            NodeSelectionStrategy::PinUntilErrorWithoutReshuffle => {
                Self::Pin(PinUntilErrorSelector::new(rng, clock, false))
            },
        }
    }
}

/// Chooses a host for each call and forwards it there.
///
/// Returns `None` when every candidate rejects, so the queue above can hold
/// the call until capacity frees up.
pub struct NodeSelectionChannel {
    hosts: Arc<HostSet>,
    selector: Mutex<(NodeSelectionStrategy, Arc<Selector>)>,
    clock: Arc<dyn Clock>,
}

impl NodeSelectionChannel {
    /// Creates a channel selecting over `hosts` with the configured strategy.
    pub fn new(hosts: Arc<HostSet>, clock: Arc<dyn Clock>) -> Self {
        let config = hosts.config();
        let selector = Arc::new(Selector::new(&config.node_selection, Arc::clone(&clock)));
        Self { hosts, selector: Mutex::new((config.node_selection.strategy, selector)), clock }
    }

    /// The host set this channel selects from.
    #[must_use]
    pub fn hosts(&self) -> &Arc<HostSet> {
        &self.hosts
    }

    /// Strategy currently in use.
    #[must_use]
    pub fn strategy(&self) -> NodeSelectionStrategy {
        self.selector.lock().0
    }

    /// Currently pinned host, for the pinning strategies.
    #[must_use]
    pub fn pinned_host(&self) -> Option<HostId> {
        match self.selector.lock().1.as_ref() {
            Selector::Pin(pin) => pin.pinned(),
            Selector::Balanced(_) => None,
        }
    }

    fn selector(&self, config: &NodeSelectionConfig) -> Arc<Selector> {
        let mut current = self.selector.lock();
        if current.0 != config.strategy {
            tracing::info!(from = %current.0, to = %config.strategy, "node selection strategy changed");
            *current = (config.strategy, Arc::new(Selector::new(config, Arc::clone(&self.clock))));
        }
        Arc::clone(&current.1)
    }
}

impl LimitedChannel for NodeSelectionChannel {
    fn maybe_execute(&self, endpoint: &Endpoint, request: &Request) -> Option<ResponseFuture> {
        let config = self.hosts.config();
        let snapshot = self.hosts.snapshot();
        if snapshot.is_empty() {
            let error = CallError::NoHostsAvailable { service: endpoint.service().to_owned() };
            return Some(Box::pin(futures::future::ready(Err(error))));
        }
        let selector = self.selector(&config.node_selection);

        if let Some(HostHint(id)) = request.attachments().get::<HostHint>() {
            if let Some(host) = snapshot.get(id) {
                return match selector.as_ref() {
                    Selector::Balanced(balanced) => {
                        balanced.prune(&snapshot);
                        balanced.execute_on(host, &config.node_selection, endpoint, request)
                    },
                    Selector::Pin(pin) => pin.execute_on(host, endpoint, request),
                };
            }
            tracing::debug!(host = %id, "hinted host not in host set, ignoring hint");
        }

        match selector.as_ref() {
            Selector::Balanced(balanced) => {
                balanced.select(&snapshot, &config.node_selection, endpoint, request)
            },
            Selector::Pin(pin) => pin.select(&snapshot, &config.node_selection, endpoint, request),
        }
    }
}

impl fmt::Debug for NodeSelectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSelectionChannel")
            .field("strategy", &self.strategy())
            .field("hosts", &self.hosts)
            .finish()
    }
}
