//! End-to-end tests of the assembled pipeline against mock hosts.
//!
//! Each test drives [`DialogueChannel`](dialogue_client::DialogueChannel)
//! through the public API only: scripted host channels stand in for the
//! transport, a manual clock drives blacklist expiry, and tokio's paused
//! clock drives backoff, stall timers and DNS refresh.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]

mod common;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use common::{dns_disabled, endpoint, ip, pipeline, pipeline_with_resolver, uris};
use dialogue_client::{
    BlacklistConfig, ClientConfig, ConcurrencyLimitConfig, DnsConfig, DnsOutcome, HostHint,
    NodeSelectionConfig, NodeSelectionStrategy, QueueConfig, RetryConfig,
    mock::{MockOutcome, ScriptedDnsResolver},
};
use dialogue_types::{CallError, Channel, Request, StatusCode};
use futures::FutureExt;

fn single_slot() -> ConcurrencyLimitConfig {
    ConcurrencyLimitConfig::builder().initial_limit(1.0).min_limit(1.0).max_limit(1.0).build().unwrap()
}

fn no_jitter_blacklist(cooldown: Duration) -> BlacklistConfig {
    BlacklistConfig::builder().cooldown(cooldown).cooldown_jitter(0.0).build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_single_failure_succeeds() {
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com"]))
        .dns(dns_disabled())
        .retry(RetryConfig::builder().max_retries(1).jitter(0.0).build().unwrap())
        .blacklist(no_jitter_blacklist(Duration::from_millis(100)))
        .build()
        .unwrap();
    let p = pipeline(config);
    p.factory.channel_or_create("a.example.com").push(MockOutcome::ConnectError);

    let call = p.channel.execute(&endpoint(), Request::default());
    // The host is blacklisted by the failure; expire it before the retry.
    let clock = p.clock.clone();
    let expire = async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        clock.advance(Duration::from_millis(200));
    };
    let (response, ()) = tokio::join!(call, expire);

    assert_eq!(response.unwrap().status(), StatusCode::OK);
    assert_eq!(p.factory.channel("a.example.com").unwrap().invocations(), 2);
    assert_eq!(p.metrics.retries(), 1);
}

#[tokio::test]
async fn test_pin_until_error_moves_after_failure() {
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com", "https://b.example.com", "https://c.example.com"]))
        .dns(dns_disabled())
        .node_selection(
            NodeSelectionConfig::builder()
                .strategy(NodeSelectionStrategy::PinUntilError)
                .seed(11)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let p = pipeline(config);

    for _ in 0..5 {
        p.channel.execute(&endpoint(), Request::default()).await.unwrap();
    }
    let first = p.channel.pinned_host().unwrap();
    let pinned = p.pinned_channel();
    assert_eq!(pinned.invocations(), 5);

    pinned.push(MockOutcome::Respond(500));
    let failed = p.channel.execute(&endpoint(), Request::default()).await.unwrap();
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);

    p.channel.execute(&endpoint(), Request::default()).await.unwrap();
    assert_ne!(p.channel.pinned_host().unwrap(), first);
    assert_eq!(pinned.invocations(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_blacklisted_host_returns_after_cooldown() {
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com"]))
        .dns(dns_disabled())
        .retry(RetryConfig::builder().max_retries(0).build().unwrap())
        .blacklist(no_jitter_blacklist(Duration::from_secs(1)))
        .build()
        .unwrap();
    let p = pipeline(config);
    let host = p.factory.channel_or_create("a.example.com");
    host.push(MockOutcome::ConnectError);

    let result = p.channel.execute(&endpoint(), Request::default()).await;
    assert!(matches!(result, Err(CallError::Connect { .. })));
    assert_eq!(p.channel.blacklist().active_count(), 1);

    // Excluded: the call waits in the queue without reaching the host.
    let mut waiting = p.channel.execute(&endpoint(), Request::default());
    assert!((&mut waiting).now_or_never().is_none());
    assert_eq!(p.channel.queue_len(), 1);
    assert_eq!(host.invocations(), 1);

    // Once the cooldown passes the stall timer dispatches it.
    p.clock.advance(Duration::from_secs(1));
    let response = tokio::time::timeout(Duration::from_secs(5), waiting).await.unwrap();
    assert_eq!(response.unwrap().status(), StatusCode::OK);
    assert_eq!(host.invocations(), 2);
    assert_eq!(p.metrics.blacklists(), 1);
}

#[tokio::test]
async fn test_queue_full_rejects_immediately() {
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com"]))
        .dns(dns_disabled())
        .concurrency(single_slot())
        .queue(QueueConfig::builder().capacity(1).build().unwrap())
        .build()
        .unwrap();
    let p = pipeline(config);
    p.factory.channel_or_create("a.example.com").push(MockOutcome::Pending);

    let _running = p.channel.execute(&endpoint(), Request::default());
    let _queued = p.channel.execute(&endpoint(), Request::default());
    assert_eq!(p.channel.queue_len(), 1);

    let rejected = p.channel.execute(&endpoint(), Request::default()).await;
    assert!(matches!(rejected, Err(CallError::QueueFull { capacity: 1 })));
    assert_eq!(p.metrics.retries(), 0);
}

#[tokio::test]
async fn test_cancelled_before_dispatch_never_reaches_host() {
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com"]))
        .dns(dns_disabled())
        .concurrency(single_slot())
        .build()
        .unwrap();
    let p = pipeline(config);
    let host = p.factory.channel_or_create("a.example.com");
    host.push(MockOutcome::Delay(Duration::from_millis(20), 200));

    let running = p.channel.execute(&endpoint(), Request::default());
    let queued = p.channel.execute(&endpoint(), Request::default());
    assert_eq!(p.channel.queue_len(), 1);
    drop(queued);
    assert_eq!(p.channel.queue_len(), 0);

    running.await.unwrap();
    assert_eq!(host.invocations(), 1);
    assert_eq!(host.cancellations(), 0);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_limit() {
    let limit = ConcurrencyLimitConfig::builder()
        .initial_limit(3.0)
        .min_limit(1.0)
        .max_limit(3.0)
        .build()
        .unwrap();
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com"]))
        .dns(dns_disabled())
        .concurrency(limit)
        .build()
        .unwrap();
    let p = pipeline(config);
    let host = p.factory.channel_or_create("a.example.com");
    for _ in 0..10 {
        host.push(MockOutcome::Delay(Duration::from_millis(5), 200));
    }

    let calls: Vec<_> = (0..10).map(|_| p.channel.execute(&endpoint(), Request::default())).collect();
    let limiter = Arc::clone(p.channel.host_snapshot().hosts()[0].limiter());
    assert_eq!(limiter.in_flight(), 3);
    assert_eq!(p.channel.queue_len(), 7);

    for result in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap().status(), StatusCode::OK);
    }
    assert!(limiter.in_flight() <= limiter.limit().floor() as usize);
    assert_eq!(host.invocations(), 10);
}

#[tokio::test]
async fn test_live_uri_update_routes_to_new_host() {
    let base = |hosts: &[&str]| {
        ClientConfig::builder().uris(uris(hosts)).dns(dns_disabled()).build().unwrap()
    };
    let p = pipeline(base(&["https://a.example.com"]));
    p.channel.execute(&endpoint(), Request::default()).await.unwrap();
    let version = p.channel.host_snapshot().version();

    p.config.update(base(&["https://b.example.com"]));
    p.channel.execute(&endpoint(), Request::default()).await.unwrap();
    assert!(p.channel.host_snapshot().version() > version);
    assert_eq!(p.factory.channel("a.example.com").unwrap().invocations(), 1);
    assert_eq!(p.factory.channel("b.example.com").unwrap().invocations(), 1);
}

#[tokio::test]
async fn test_host_hint_sticks_to_host() {
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com", "https://b.example.com"]))
        .dns(dns_disabled())
        .build()
        .unwrap();
    let p = pipeline(config);
    let snapshot = p.channel.host_snapshot();
    let target = snapshot.hosts().iter().find(|h| h.target().host() == "b.example.com").unwrap();
    let request = Request::builder().attach(HostHint(target.id().clone())).build();

    for _ in 0..4 {
        p.channel.execute(&endpoint(), request.clone()).await.unwrap();
    }
    assert_eq!(p.factory.channel("b.example.com").unwrap().invocations(), 4);
    assert_eq!(p.total_invocations(), 4);
}

#[tokio::test]
async fn test_empty_host_set_fails_fast() {
    let p = pipeline(ClientConfig::builder().dns(dns_disabled()).build().unwrap());
    let result = p.channel.execute(&endpoint(), Request::default()).await;
    assert!(matches!(result, Err(CallError::NoHostsAvailable { ref service }) if service == "catalog"));
}

#[tokio::test(start_paused = true)]
async fn test_dns_failure_keeps_last_known_good_addresses() {
    let resolver = Arc::new(ScriptedDnsResolver::new());
    resolver.push("a.example.com", Ok(vec![ip(1)]));
    resolver.push("a.example.com", Err("SERVFAIL".to_owned()));
    let config = ClientConfig::builder()
        .uris(uris(&["https://a.example.com"]))
        .dns(DnsConfig::builder().refresh_interval(Duration::from_secs(1)).build().unwrap())
        .build()
        .unwrap();
    let p = pipeline_with_resolver(config, resolver.clone());
    let expected = Some(SocketAddr::new(ip(1), 443));

    // First round publishes the resolved address.
    for _ in 0..100 {
        if p.channel.host_snapshot().hosts().first().and_then(|h| h.address()) == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let first = p.channel.host_snapshot();
    assert_eq!(first.hosts()[0].address(), expected);

    // Second round fails; the last good address stays in use.
    while resolver.lookups("a.example.com") < 2 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = p.channel.host_snapshot();
    assert_eq!(second.version(), first.version());
    assert_eq!(second.hosts()[0].address(), expected);
    assert_eq!(p.metrics.dns_outcomes(DnsOutcome::Fallback), 1);
    assert_eq!(
        p.channel.dns_cache().unwrap().get("a.example.com"),
        Some(vec![ip(1)])
    );

    p.channel.execute(&endpoint(), Request::default()).await.unwrap();
    p.channel.close();
}
