//! The assembled client pipeline.

use std::{fmt, sync::Arc};

use dialogue_types::{CallError, Channel, Endpoint, Request, Response, ResponseFuture};

use crate::{
    blacklist::Blacklist,
    clock::{Clock, default_clock},
    config::{ClientConfig, ConfigError},
    dns::{self, DnsCache, DnsResolver, DnsWorkerHandle, HickoryDnsResolver},
    host::{HostChannelFactory, HostId, HostSet, HostSnapshot},
    metrics::{ClientMetrics, default_metrics},
    queue::QueuedChannel,
    refreshable::Refreshable,
    retry::RetryingChannel,
    selection::NodeSelectionChannel,
};

/// Client channel for one service: retry, queue, node selection, blacklist and
/// per-host concurrency limiting over transport channels from a
/// [`HostChannelFactory`].
///
/// Each instance owns all of its state (blacklist, DNS cache, selection state,
/// metrics sink); nothing is shared between instances.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use dialogue_client::{ClientConfig, DialogueChannel, mock::MockHostChannelFactory};
/// use dialogue_types::{Channel, Endpoint, Method, Request};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::builder()
///     .uris(vec!["https://a.example.com:8443".to_owned()])
///     .build()?;
/// let channel = DialogueChannel::builder()
///     .config(config.into())
///     .factory(Arc::new(MockHostChannelFactory::new()))
///     .build()?;
///
/// let endpoint = Endpoint::parse("catalog", "getItem", "1.0", Method::GET, "/items/{id}")?;
/// let request = Request::builder().path_param("id", "42").build();
/// let response = channel.execute(&endpoint, request).await?;
/// response.close();
/// channel.close();
/// # Ok(())
/// # }
/// ```
pub struct DialogueChannel {
    retry: RetryingChannel,
    queue: Arc<QueuedChannel>,
    selection: Arc<NodeSelectionChannel>,
    dns_cache: Option<Arc<DnsCache>>,
    dns_worker: Option<DnsWorkerHandle>,
    config: Refreshable<ClientConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn ClientMetrics>,
}

#[bon::bon]
impl DialogueChannel {
    /// Builds the pipeline.
    ///
    /// When DNS refresh is enabled and a tokio runtime is available, a
    /// background worker resolves configured hostnames; without a runtime
    /// hostnames are left for the transport to resolve.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the current configuration is
    /// invalid.
    #[builder]
    pub fn new(
        config: Refreshable<ClientConfig>,
        factory: Arc<dyn HostChannelFactory>,
        metrics: Option<Arc<dyn ClientMetrics>>,
        clock: Option<Arc<dyn Clock>>,
        resolver: Option<Arc<dyn DnsResolver>>,
    ) -> Result<Self, ConfigError> {
        let current = config.get();
        current.validate()?;
        let metrics = metrics.unwrap_or_else(default_metrics);
        let clock = clock.unwrap_or_else(default_clock);

        let (dns_cache, dns_worker, dns_rx) = if current.dns.enabled {
            if tokio::runtime::Handle::try_current().is_ok() {
                let resolver = resolver.unwrap_or_else(|| Arc::new(HickoryDnsResolver::new()));
                let cache = Arc::new(DnsCache::new(Arc::clone(&clock), Arc::clone(&metrics)));
                let (handle, rx) = dns::spawn(config.clone(), resolver, Arc::clone(&cache));
                (Some(cache), Some(handle), Some(rx))
            } else {
                tracing::warn!(
                    client = %current.client_name,
                    "no tokio runtime, DNS refresh disabled"
                );
                (None, None, None)
            }
        } else {
            (None, None, None)
        };

        let blacklist = Arc::new(Blacklist::new(
            current.blacklist.clone(),
            current.node_selection.seed,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let hosts = Arc::new(HostSet::new(
            config.clone(),
            dns_rx,
            factory,
            blacklist,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let selection = Arc::new(NodeSelectionChannel::new(hosts, Arc::clone(&clock)));
        let queue = Arc::new(QueuedChannel::new(
            selection.clone(),
            config.clone(),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let retry = RetryingChannel::new(queue.clone(), config.clone(), Arc::clone(&metrics));

        tracing::debug!(
            client = %current.client_name,
            uris = current.uris.len(),
            strategy = %current.node_selection.strategy,
            dns = dns_worker.is_some(),
            "built client channel"
        );

        Ok(Self { retry, queue, selection, dns_cache, dns_worker, config, clock, metrics })
    }
}

impl DialogueChannel {
    /// Current host set, rebuilt first if configuration or DNS changed.
    #[must_use]
    pub fn host_snapshot(&self) -> Arc<HostSnapshot> {
        self.selection.hosts().snapshot()
    }

    /// The blacklist shared by this channel's hosts.
    #[must_use]
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        self.selection.hosts().blacklist()
    }

    /// Host currently pinned by a pinning strategy.
    #[must_use]
    pub fn pinned_host(&self) -> Option<HostId> {
        self.selection.pinned_host()
    }

    /// Calls waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// DNS cache, if background resolution is running.
    #[must_use]
    pub fn dns_cache(&self) -> Option<&Arc<DnsCache>> {
        self.dns_cache.as_ref()
    }

    /// Live configuration cell.
    #[must_use]
    pub fn config(&self) -> &Refreshable<ClientConfig> {
        &self.config
    }

    /// Stops the DNS worker and fails every queued call with
    /// [`CallError::Cancelled`]. Calls already on a host run to completion.
    pub fn close(&self) {
        if let Some(worker) = &self.dns_worker {
            worker.shutdown();
        }
        self.queue.close();
        tracing::debug!(client = %self.config.get().client_name, "client channel closed");
    }
}

impl Channel for DialogueChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let call = self.retry.execute(endpoint, request);
        let clock = Arc::clone(&self.clock);
        let metrics = Arc::clone(&self.metrics);
        let label = endpoint.to_string();
        let start = clock.now();
        Box::pin(async move {
            let result: Result<Response, CallError> = call.await;
            let success = result.as_ref().is_ok_and(|response| response.status().is_success());
            metrics.record_request(&label, clock.now().saturating_duration_since(start), success);
            if let Err(e) = &result {
                tracing::debug!(endpoint = %label, error = %e, "call failed");
            }
            result
        })
    }
}

impl fmt::Debug for DialogueChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogueChannel")
            .field("selection", &self.selection)
            .field("queue_len", &self.queue_len())
            .field("dns", &self.dns_worker.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use dialogue_types::{Method, StatusCode};

    use super::*;
    use crate::{
        config::DnsConfig,
        mock::{CountingMetrics, MockHostChannelFactory},
    };

    fn config(uris: &[&str]) -> ClientConfig {
        ClientConfig::builder()
            .uris(uris.iter().map(|u| (*u).to_owned()).collect())
            .dns(DnsConfig::builder().enabled(false).build().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builds_without_runtime() {
        let config = ClientConfig::builder().uris(vec!["https://a.example.com".to_owned()]).build().unwrap();
        let channel = DialogueChannel::builder()
            .config(config.into())
            .factory(Arc::new(MockHostChannelFactory::new()))
            .build()
            .unwrap();
        assert!(channel.dns_cache().is_none());
        assert_eq!(channel.host_snapshot().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config(&["https://a.example.com"]);
        config.queue.capacity = 0;
        let result = DialogueChannel::builder()
            .config(config.into())
            .factory(Arc::new(MockHostChannelFactory::new()))
            .build();
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_records_top_level_requests() {
        let metrics = Arc::new(CountingMetrics::default());
        let factory = Arc::new(MockHostChannelFactory::new());
        let channel = DialogueChannel::builder()
            .config(config(&["https://a.example.com"]).into())
            .factory(factory.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        let endpoint = Endpoint::parse("svc", "op", "1", Method::GET, "/op").unwrap();

        let response = channel.execute(&endpoint, Request::default()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(metrics.requests(), 1);
        assert_eq!(metrics.failed_requests(), 0);
        assert_eq!(factory.channel("a.example.com").unwrap().invocations(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_new_calls() {
        let channel = DialogueChannel::builder()
            .config(config(&["https://a.example.com"]).into())
            .factory(Arc::new(MockHostChannelFactory::new()))
            .build()
            .unwrap();
        let endpoint = Endpoint::parse("svc", "op", "1", Method::GET, "/op").unwrap();
        channel.close();
        assert!(matches!(channel.execute(&endpoint, Request::default()).await, Err(CallError::Cancelled)));
    }
}
