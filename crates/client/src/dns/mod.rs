//! Background hostname resolution with caching and fallback.

mod cache;
mod resolver;
mod worker;

pub use cache::{DnsCache, DnsCacheEntry};
pub use resolver::{DnsError, DnsResolver, HickoryDnsResolver};
pub use worker::{DnsSnapshot, DnsWorkerHandle, spawn};
