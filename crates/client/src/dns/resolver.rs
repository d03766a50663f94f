//! Hostname resolution.

use std::{fmt, net::IpAddr};

use futures::future::BoxFuture;
use hickory_resolver::{Resolver, config::ResolverConfig, name_server::TokioConnectionProvider};
use parking_lot::RwLock;
use snafu::{ResultExt, Snafu};

/// Errors that can occur during hostname resolution.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DnsError {
    /// The system resolver failed.
    #[snafu(display("DNS resolution failed for {hostname}: {source}"))]
    Resolution {
        /// Hostname being resolved.
        hostname: String,
        /// Resolver error.
        source: hickory_resolver::ResolveError,
    },

    /// A custom resolver failed.
    #[snafu(display("DNS lookup failed for {hostname}: {message}"))]
    Lookup {
        /// Hostname being resolved.
        hostname: String,
        /// Error description.
        message: String,
    },
}

/// Resolves hostnames to IP addresses.
pub trait DnsResolver: Send + Sync + fmt::Debug {
    /// Resolves `hostname`. An empty list is a valid answer.
    fn resolve<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>>;
}

/// [`DnsResolver`] backed by `hickory-resolver` with the system configuration.
#[derive(Default)]
pub struct HickoryDnsResolver {
    /// Created on first use so construction needs no runtime.
    resolver: RwLock<Option<Resolver<TokioConnectionProvider>>>,
}

impl HickoryDnsResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self) -> Resolver<TokioConnectionProvider> {
        if let Some(resolver) = self.resolver.read().as_ref() {
            return resolver.clone();
        }

        let mut guard = self.resolver.write();
        guard
            .get_or_insert_with(|| {
                Resolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            })
            .clone()
    }
}

impl DnsResolver for HickoryDnsResolver {
    fn resolve<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, DnsError>> {
        Box::pin(async move {
            let resolver = self.get_or_create();
            let lookup = resolver.lookup_ip(hostname).await.context(ResolutionSnafu { hostname })?;
            Ok(lookup.iter().collect())
        })
    }
}

impl fmt::Debug for HickoryDnsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HickoryDnsResolver")
            .field("initialized", &self.resolver.read().is_some())
            .finish()
    }
}
