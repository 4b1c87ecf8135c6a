//! Delayed and cancelling status events.

mod common;

use std::time::Duration;

use common::{STATUS_ABSENT, STATUS_PRESENT, TestHandle, open_enabled, settle};
use upos_runtime::DeviceRegistry;

async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_absence_is_never_observed() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set("Timeout", 100).unwrap();

    handle.status(STATUS_PRESENT);
    settle().await;
    assert!(service.get_bool("Present").unwrap());

    handle.status(STATUS_ABSENT);
    assert_eq!(
        service.property_set().buffered_status(),
        Some(STATUS_ABSENT)
    );
    advance(50).await;
    assert!(service.get_bool("Present").unwrap());

    handle.status(STATUS_PRESENT);
    assert_eq!(service.property_set().buffered_status(), None);
    advance(200).await;

    assert_eq!(listener.statuses(), vec![STATUS_PRESENT]);
    assert!(service.get_bool("Present").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_absence_delivered_after_timeout() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set("Timeout", 100).unwrap();

    handle.status(STATUS_PRESENT);
    handle.status(STATUS_ABSENT);
    advance(99).await;
    assert!(service.get_bool("Present").unwrap());
    assert_eq!(listener.statuses(), vec![STATUS_PRESENT]);

    advance(2).await;
    assert!(!service.get_bool("Present").unwrap());
    assert_eq!(listener.statuses(), vec![STATUS_PRESENT, STATUS_ABSENT]);
}

#[tokio::test(start_paused = true)]
async fn test_newer_delayed_status_supersedes_older() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set("Timeout", 100).unwrap();

    handle.status(STATUS_PRESENT);
    handle.status(STATUS_ABSENT);
    advance(60).await;
    handle.status(STATUS_ABSENT);
    advance(60).await;
    assert_eq!(listener.statuses(), vec![STATUS_PRESENT]);

    advance(60).await;
    assert_eq!(listener.statuses(), vec![STATUS_PRESENT, STATUS_ABSENT]);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_delivers_at_once() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;

    handle.status(STATUS_PRESENT);
    handle.status(STATUS_ABSENT);
    settle().await;
    assert_eq!(listener.statuses(), vec![STATUS_PRESENT, STATUS_ABSENT]);
    assert!(!service.get_bool("Present").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_buffered_status() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set("Timeout", 100).unwrap();

    handle.status(STATUS_ABSENT);
    service.close().await.unwrap();
    advance(200).await;

    assert!(listener.statuses().is_empty());
    assert_eq!(service.property_set().buffered_status(), None);
}
