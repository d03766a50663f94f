//! Shared fixtures for pipeline integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
#![allow(dead_code)]

use std::{net::IpAddr, sync::Arc};

use dialogue_client::{
    ClientConfig, DialogueChannel, DnsConfig, ManualClock, Refreshable,
    dns::DnsResolver,
    mock::{CountingMetrics, MockChannel, MockHostChannelFactory},
};
use dialogue_types::{Endpoint, Method};

/// A pipeline wired to mock collaborators.
pub struct Pipeline {
    pub channel: DialogueChannel,
    pub config: Refreshable<ClientConfig>,
    pub factory: Arc<MockHostChannelFactory>,
    pub metrics: Arc<CountingMetrics>,
    pub clock: ManualClock,
}

impl Pipeline {
    /// Mock channel of the host currently pinned by the pipeline.
    pub fn pinned_channel(&self) -> Arc<MockChannel> {
        let pinned = self.channel.pinned_host().expect("a host is pinned");
        let snapshot = self.channel.host_snapshot();
        let host = snapshot.get(&pinned).expect("pinned host is in the host set");
        self.factory.channel(host.target().host()).expect("pinned host has a channel")
    }

    /// Total calls made across every host.
    pub fn total_invocations(&self) -> usize {
        self.channel
            .host_snapshot()
            .hosts()
            .iter()
            .filter_map(|host| self.factory.channel(host.target().host()))
            .map(|channel| channel.invocations())
            .sum()
    }
}

/// Builds a pipeline with a manual clock and DNS refresh disabled.
pub fn pipeline(config: ClientConfig) -> Pipeline {
    build(config, None)
}

/// Builds a pipeline whose DNS worker uses `resolver`.
pub fn pipeline_with_resolver(config: ClientConfig, resolver: Arc<dyn DnsResolver>) -> Pipeline {
    build(config, Some(resolver))
}

fn build(config: ClientConfig, resolver: Option<Arc<dyn DnsResolver>>) -> Pipeline {
    let config = Refreshable::new(config);
    let factory = Arc::new(MockHostChannelFactory::new());
    let metrics = Arc::new(CountingMetrics::default());
    let clock = ManualClock::new();
    let channel = DialogueChannel::builder()
        .config(config.clone())
        .factory(factory.clone())
        .metrics(metrics.clone())
        .clock(Arc::new(clock.clone()))
        .maybe_resolver(resolver)
        .build()
        .unwrap();
    Pipeline { channel, config, factory, metrics, clock }
}

/// Config builder defaults for tests: given uris, DNS off, seeded selection.
pub fn uris(uris: &[&str]) -> Vec<String> {
    uris.iter().map(|u| (*u).to_owned()).collect()
}

pub fn dns_disabled() -> DnsConfig {
    DnsConfig::builder().enabled(false).build().unwrap()
}

pub fn endpoint() -> Endpoint {
    Endpoint::parse("catalog", "getItem", "1.0", Method::GET, "/items/{id}").unwrap()
}

pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, last])
}
