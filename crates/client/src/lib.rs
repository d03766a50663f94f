//! Client-side RPC channel pipeline.
//!
//! Turns "call this endpoint" into a load-balanced HTTP call across a dynamic
//! set of upstream hosts, making every routing decision locally from this
//! process's own call history.
//!
//! # Features
//!
//! - **Adaptive concurrency**: per-host AIMD limit on calls in flight
//! - **Backpressure**: bounded queue with FIFO or per-endpoint round-robin fairness
//! - **Node selection**: `BALANCED`, `PIN_UNTIL_ERROR` and `PIN_UNTIL_ERROR_WITHOUT_RESHUFFLE`
//! - **Failure isolation**: jittered blacklist cooldown for failing hosts
//! - **Retries**: exponential backoff (backon) for transport failures and 429/503
//! - **DNS refresh**: background resolution with last-known-good fallback
//! - **Live config**: [`Refreshable`] configuration applied without dropping calls
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dialogue_client::{
//!     ClientConfig, DialogueChannel, NodeSelectionConfig, NodeSelectionStrategy,
//!     mock::MockHostChannelFactory,
//! };
//! use dialogue_types::{Channel, Endpoint, Method, Request};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::builder()
//!     .uris(vec!["https://a.example.com".to_owned(), "https://b.example.com".to_owned()])
//!     .node_selection(
//!         NodeSelectionConfig::builder().strategy(NodeSelectionStrategy::PinUntilError).build()?,
//!     )
//!     .build()?;
//!
//! let channel = DialogueChannel::builder()
//!     .config(config.into())
//!     .factory(Arc::new(MockHostChannelFactory::new()))
//!     .build()?;
//!
//! let endpoint = Endpoint::parse("catalog", "listItems", "1.0", Method::GET, "/items")?;
//! let response = channel.execute(&endpoint, Request::default()).await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 DialogueChannel (Public API)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  RetryingChannel (backon)                   │
//! │   Exponential backoff │ Jitter │ Replayable requests only   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                       QueuedChannel                         │
//! │   Bounded │ FIFO / round-robin │ Serialized dispatch        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   NodeSelectionChannel                      │
//! │   Balanced │ Pin until error │ Host hints                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │     per host: BlacklistingChannel → ConcurrencyLimiter      │
//! │                 → transport Channel (factory)               │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲
//!   HostSet ◄─────┴── Refreshable<ClientConfig> + DNS worker (hickory)
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blacklist;
mod channel;
mod clock;
mod config;
pub mod dns;
mod host;
mod limiter;
mod metrics;
pub mod mock;
mod outcome;
mod queue;
mod refreshable;
mod retry;
mod selection;

// Public API exports
pub use blacklist::{Blacklist, BlacklistEntry, BlacklistReason, BlacklistingChannel};
pub use channel::DialogueChannel;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BlacklistConfig, ClientConfig, ConcurrencyLimitConfig, ConfigError, DnsConfig,
    NodeSelectionConfig, NodeSelectionStrategy, QueueConfig, QueueFairness, RetryConfig,
};
pub use host::{HostChannelFactory, HostId, HostSet, HostSnapshot, TargetUri, Upstream};
pub use limiter::{ConcurrencyLimitedChannel, ConcurrencyLimiter, LimiterPermit};
pub use metrics::{ClientMetrics, DnsOutcome, MetricsClientMetrics, NoopClientMetrics};
pub use queue::QueuedChannel;
pub use refreshable::Refreshable;
pub use retry::RetryingChannel;
pub use selection::{HostHint, NodeSelectionChannel};
