//! Discovery engine against fake devices on localhost
//!
//! These tests run in real time with short cache times.

use miio_discovery::mock::StaticResolver;
use miio_discovery::tokens::{FileTokenStore, TokenStore};
use miio_discovery::{Browser, DiscoveryEvent, Token};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

mod common;
use common::{browser_for, config_for, within, FakeDevice, TOKEN_HEX};

async fn next_event(events: &mut broadcast::Receiver<DiscoveryEvent>) -> DiscoveryEvent {
    within(10, events.recv()).await.expect("event channel open")
}

#[tokio::test]
async fn test_device_with_token_is_announced_with_model() {
    let device = FakeDevice::with_token(0x0A0B_0C0D).await;
    let mut browser = browser_for(&device, 1800);
    let mut events = browser.subscribe();
    browser.start().await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.kind(), "available");

    let record = event.record();
    assert_eq!(record.id, "168496141");
    assert_eq!(record.socket_addr(), device.addr);
    assert_eq!(record.token.map(|t| t.to_hex()).as_deref(), Some(TOKEN_HEX));
    assert!(record.auto_token);
    assert_eq!(
        record.hostname.as_deref(),
        Some("zhimi-airpurifier-m1_miio168496141")
    );
    assert_eq!(record.model.as_deref(), Some("zhimi.airpurifier.m1"));
    assert_eq!(record.device_type.as_deref(), Some("air-purifier"));

    let services = browser.services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "168496141");

    browser.stop().await;
}

#[tokio::test]
async fn test_each_search_cycle_probes_twice() {
    let device = FakeDevice::with_token(1).await;
    // 3 s cache time gives a 1 s search interval
    let mut browser = browser_for(&device, 3);
    browser.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(device.probes(), 2);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(device.probes(), 4);

    browser.stop().await;
}

#[tokio::test]
async fn test_slow_reverse_dns_is_bounded_by_grace_period() {
    let device = FakeDevice::with_token(2).await;
    let resolver = StaticResolver::hostname("never-used_miio2").with_delay(Duration::from_secs(60));
    let mut browser =
        Browser::new(config_for(&device, 1800)).with_reverse_resolver(Arc::new(resolver));
    let mut events = browser.subscribe();

    let started = tokio::time::Instant::now();
    browser.start().await.unwrap();

    let event = next_event(&mut events).await;
    let elapsed = started.elapsed();
    assert_eq!(event.kind(), "available");
    assert!(event.record().hostname.is_none());
    assert!(elapsed >= Duration::from_secs(4), "announced after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(7), "announced after {elapsed:?}");

    browser.stop().await;
}

#[tokio::test]
async fn test_silent_device_becomes_unavailable() {
    let device = FakeDevice::with_token(3).await;
    let mut browser = browser_for(&device, 2);
    let mut events = browser.subscribe();
    browser.start().await.unwrap();

    assert_eq!(next_event(&mut events).await.kind(), "available");
    device.silence();

    let event = next_event(&mut events).await;
    assert_eq!(event.kind(), "unavailable");
    assert_eq!(event.record().id, "3");
    assert!(browser.services().await.unwrap().is_empty());

    browser.stop().await;
}

#[tokio::test]
async fn test_address_change_emits_update() {
    let device = FakeDevice::with_token(7).await;
    let mut browser = browser_for(&device, 1800);
    let mut events = browser.subscribe();
    browser.start().await.unwrap();
    let engine = browser.local_addr().unwrap();

    assert_eq!(next_event(&mut events).await.kind(), "available");
    // Let the follow-up broadcast of the first cycle settle
    tokio::time::sleep(Duration::from_millis(700)).await;

    let token: Token = TOKEN_HEX.parse().unwrap();
    let moved = FakeDevice::start("127.0.0.2", 7, *token.as_bytes()).await;
    moved.announce_to(engine).await;

    match next_event(&mut events).await {
        DiscoveryEvent::Update(record) => {
            assert_eq!(record.id, "7");
            assert_eq!(record.address.to_string(), "127.0.0.2");
        }
        other => panic!("expected update, got {other:?}"),
    }

    // Same address again is not an update
    moved.announce_to(engine).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err()
    );

    browser.stop().await;
}

#[tokio::test]
async fn test_hidden_token_comes_from_token_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.json");
    let token: Token = TOKEN_HEX.parse().unwrap();
    FileTokenStore::new(&path).put("42", token).await.unwrap();

    let device = FakeDevice::hidden_token(42).await;
    let mut config = config_for(&device, 1800);
    config.use_token_storage = true;
    config.token_store_path = Some(path);

    let mut browser = Browser::new(config)
        .with_reverse_resolver(Arc::new(StaticResolver::none()));
    let mut events = browser.subscribe();
    browser.start().await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.record().token, Some(token));
    assert!(!event.record().auto_token);

    browser.stop().await;
}

#[tokio::test]
async fn test_hidden_token_falls_back_to_manual_tokens() {
    let token: Token = TOKEN_HEX.parse().unwrap();
    let device = FakeDevice::hidden_token(43).await;
    let config = config_for(&device, 1800).with_token("43", token);

    let mut browser = Browser::new(config)
        .with_reverse_resolver(Arc::new(StaticResolver::none()));
    let mut events = browser.subscribe();
    browser.start().await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.record().token, Some(token));
    assert!(!event.record().auto_token);

    browser.stop().await;
}

#[tokio::test]
async fn test_tokenless_device_is_still_announced() {
    let device = FakeDevice::start("127.0.0.1", 44, [0x00; 16]).await;
    let mut browser = Browser::new(config_for(&device, 1800))
        .with_reverse_resolver(Arc::new(StaticResolver::none()));
    let mut events = browser.subscribe();
    browser.start().await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.kind(), "available");
    assert!(!event.record().has_token());
    assert!(event.record().model.is_none());

    browser.stop().await;
}

#[tokio::test]
async fn test_stop_drops_records_silently() {
    let device = FakeDevice::with_token(5).await;
    let mut browser = browser_for(&device, 1800);
    let mut events = browser.subscribe();
    browser.start().await.unwrap();
    assert_eq!(next_event(&mut events).await.kind(), "available");

    browser.stop().await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    // Restarting rediscovers the device
    browser.start().await.unwrap();
    assert_eq!(next_event(&mut events).await.kind(), "available");
    browser.stop().await;
}

#[tokio::test]
async fn test_stop_during_grace_period_announces_nothing() {
    let device = FakeDevice::with_token(6).await;
    let resolver = StaticResolver::hostname("never-used_miio6").with_delay(Duration::from_secs(60));
    let mut browser =
        Browser::new(config_for(&device, 1800)).with_reverse_resolver(Arc::new(resolver));
    let mut events = browser.subscribe();
    browser.start().await.unwrap();

    // The device has replied and is waiting on reverse DNS
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(device.probes() >= 1);
    browser.stop().await;

    // Past the point where the grace timer would have fired
    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(!browser.is_running());
}
