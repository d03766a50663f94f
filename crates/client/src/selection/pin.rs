//! Sticky host selection.
//!
//! ```text
//!            ┌──────── success ────────┐
//!            ▼                         │
//! ┌─────────────────┐  call fails  ┌───┴─────────┐
//! │ Pinned(host A)  ├─────────────►│ Unpinned    │── next call pins a random
//! └───────┬─────────┘              │ (avoid A)   │   host other than A
//!         │                        └─────────────┘
//!         └── reshuffle interval elapsed / A blacklisted / A removed ──► re-pin
//! ```
//!
//! A pinned host whose limiter is full is not abandoned: the call is refused
//! and waits in the queue.

use std::{sync::Arc, time::Instant};

use dialogue_types::{Endpoint, LimitedChannel, Request, ResponseFuture};
use parking_lot::Mutex;
use rand::{Rng, rngs::StdRng};

use crate::{
    clock::Clock,
    config::NodeSelectionConfig,
    host::{HostId, HostSnapshot, Upstream},
    outcome::CallOutcome,
};

#[derive(Debug, Default)]
struct PinState {
    pinned: Option<HostId>,
    pinned_at: Option<Instant>,
    /// Host that last failed; skipped by the next pick when possible.
    avoid: Option<HostId>,
    failures: u64,
}

#[derive(Debug)]
pub(crate) struct PinUntilErrorSelector {
    state: Arc<Mutex<PinState>>,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
    reshuffle: bool,
}

impl PinUntilErrorSelector {
    /// `reshuffle` enables the periodic re-pin configured by
    /// `reshuffle_interval`.
    pub(crate) fn new(rng: StdRng, clock: Arc<dyn Clock>, reshuffle: bool) -> Self {
        Self { state: Arc::new(Mutex::new(PinState::default())), rng: Mutex::new(rng), clock, reshuffle }
    }

    pub(crate) fn pinned(&self) -> Option<HostId> {
        self.state.lock().pinned.clone()
    }

    pub(crate) fn failures(&self) -> u64 {
        self.state.lock().failures
    }

    pub(crate) fn select(
        &self,
        snapshot: &HostSnapshot,
        config: &NodeSelectionConfig,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<ResponseFuture> {
        for _ in 0..snapshot.len().max(1) {
            let host = self.current(snapshot, config)?;
            if let Some(call) = self.execute_on(&host, endpoint, request) {
                return Some(call);
            }
            if !host.is_blacklisted() {
                // Limiter full: keep the pin and let the queue wait.
                return None;
            }
            let mut state = self.state.lock();
            if state.pinned.as_ref() == Some(host.id()) {
                state.pinned = None;
                state.avoid = Some(host.id().clone());
            }
        }
        None
    }

    /// Runs the call on one host, unpinning it if the call fails.
    pub(crate) fn execute_on(
        &self,
        host: &Upstream,
        endpoint: &Endpoint,
        request: &Request,
    ) -> Option<ResponseFuture> {
        let call = host.maybe_execute(endpoint, request)?;
        let state = Arc::clone(&self.state);
        let id = host.id().clone();
        Some(Box::pin(async move {
            let result = call.await;
            let outcome = CallOutcome::classify(&result);
            if outcome.is_failure() {
                let mut state = state.lock();
                if state.pinned.as_ref() == Some(&id) {
                    state.pinned = None;
                    state.pinned_at = None;
                    state.avoid = Some(id.clone());
                    state.failures += 1;
                    tracing::debug!(host = %id, ?outcome, "unpinning host after failure");
                }
            }
            result
        }))
    }

    /// Returns the pinned host, re-pinning first if needed.
    fn current(&self, snapshot: &HostSnapshot, config: &NodeSelectionConfig) -> Option<Arc<Upstream>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(pinned) = state.pinned.clone() {
            let due = self.reshuffle
                && config.reshuffle_interval.is_some_and(|interval| {
                    state.pinned_at.is_some_and(|at| now.saturating_duration_since(at) >= interval)
                });
            match snapshot.get(&pinned) {
                Some(host) if !due && !host.is_blacklisted() => return Some(Arc::clone(host)),
                Some(host) if due => {
                    tracing::debug!(host = %host.id(), "reshuffling pinned host");
                },
                _ => {},
            }
            // Moves off the host unless it is the only one left.
            state.avoid = Some(pinned);
        }

        let host = self.pick(snapshot, state.avoid.as_ref())?;
        tracing::debug!(host = %host.id(), "pinned host");
        state.pinned = Some(host.id().clone());
        state.pinned_at = Some(now);
        state.avoid = None;
        Some(host)
    }

    /// Picks uniformly among selectable hosts, preferring any but `avoid`.
    fn pick(&self, snapshot: &HostSnapshot, avoid: Option<&HostId>) -> Option<Arc<Upstream>> {
        let available: Vec<&Arc<Upstream>> =
            snapshot.hosts().iter().filter(|host| !host.is_blacklisted()).collect();
        let preferred: Vec<&Arc<Upstream>> =
            available.iter().copied().filter(|host| Some(host.id()) != avoid).collect();
        let candidates = if preferred.is_empty() { available } else { preferred };
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.lock().random_range(0..candidates.len());
        Some(Arc::clone(candidates[index]))
    }
}
