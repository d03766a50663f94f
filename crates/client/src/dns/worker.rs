//! Background DNS refresh task.
//!
//! ```text
//!            ┌──────────── refresh_interval or config change ─────────────┐
//!            ▼                                                            │
//! read live uris ──► resolve each hostname ──► DnsCache ──► DnsSnapshot ──┘
//!                                                              │
//!                                          watch::Sender ──────┴──► HostSet
//! ```
//!
//! The task stops when its [`DnsWorkerHandle`] is shut down or dropped, or on
//! its own once every receiver of the snapshot cell is gone.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    net::IpAddr,
    sync::Arc,
};

use futures::future::join_all;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{cache::DnsCache, resolver::DnsResolver};
use crate::{config::ClientConfig, host::TargetUri, refreshable::Refreshable};

/// Immutable hostname → addresses map published by the worker.
///
/// Only hostnames with at least one effective address appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsSnapshot {
    addresses: BTreeMap<String, Vec<IpAddr>>,
}

impl DnsSnapshot {
    /// Addresses for `hostname`.
    #[must_use]
    pub fn addresses(&self, hostname: &str) -> Option<&[IpAddr]> {
        self.addresses.get(hostname).map(Vec::as_slice)
    }

    /// Number of resolved hostnames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Returns true if nothing resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl FromIterator<(String, Vec<IpAddr>)> for DnsSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Vec<IpAddr>)>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().filter(|(_, addresses)| !addresses.is_empty()).collect(),
        }
    }
}

/// Handle to a running DNS worker.
///
/// Dropping the handle stops the worker.
#[derive(Debug)]
pub struct DnsWorkerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DnsWorkerHandle {
    /// Signals the worker to stop. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Returns true once the worker task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the worker task to exit.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "DNS worker task failed");
        }
    }
}

impl Drop for DnsWorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns the worker on the current tokio runtime.
///
/// The first resolution round starts immediately.
///
/// # Panics
///
/// Panics if called outside a tokio runtime, like [`tokio::spawn`].
pub fn spawn(
    config: Refreshable<ClientConfig>,
    resolver: Arc<dyn DnsResolver>,
    cache: Arc<DnsCache>,
) -> (DnsWorkerHandle, watch::Receiver<Arc<DnsSnapshot>>) {
    let (tx, rx) = watch::channel(Arc::new(DnsSnapshot::default()));
    let token = CancellationToken::new();
    let task = tokio::spawn(run(config, resolver, cache, tx, token.clone()));
    (DnsWorkerHandle { token, task: Some(task) }, rx)
}

async fn run(
    config: Refreshable<ClientConfig>,
    resolver: Arc<dyn DnsResolver>,
    cache: Arc<DnsCache>,
    tx: watch::Sender<Arc<DnsSnapshot>>,
    token: CancellationToken,
) {
    let mut config_rx = config.subscribe();
    loop {
        config_rx.mark_unchanged();
        let current = config.get();

        let snapshot = tokio::select! {
            () = token.cancelled() => break,
            snapshot = resolve_round(&current, resolver.as_ref(), &cache) => snapshot,
        };
        tx.send_if_modified(|published| {
            if **published == snapshot {
                return false;
            }
            tracing::debug!(hostnames = snapshot.len(), "publishing DNS snapshot");
            *published = Arc::new(snapshot);
            true
        });

        tokio::select! {
            () = token.cancelled() => break,
            () = tx.closed() => {
                tracing::debug!("all DNS snapshot receivers dropped");
                break;
            },
            () = tokio::time::sleep(current.dns.refresh_interval) => {},
            Ok(()) = config_rx.changed() => {},
        }
    }
    tracing::debug!("DNS worker shutting down");
}

/// Resolves every configured hostname once.
async fn resolve_round(
    config: &ClientConfig,
    resolver: &dyn DnsResolver,
    cache: &DnsCache,
) -> DnsSnapshot {
    let hostnames = hostnames(config);
    let lookups = hostnames.iter().map(|hostname| async move {
        let result = resolver.resolve(hostname).await;
        (hostname.clone(), cache.apply(hostname, result))
    });
    let resolved = join_all(lookups).await;
    cache.retain(&hostnames.iter().cloned().collect::<HashSet<_>>());
    resolved.into_iter().collect()
}

/// Hostnames that need resolving: every configured host that is not an IP
/// literal.
fn hostnames(config: &ClientConfig) -> BTreeSet<String> {
    config
        .uris
        .iter()
        .filter_map(|uri| TargetUri::parse(uri, config.dns.default_port).ok())
        .filter(|target| target.ip_literal().is_none())
        .map(|target| target.host().to_owned())
        .collect()
}
