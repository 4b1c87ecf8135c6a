//! Event buffering and delivery order.

mod common;

use std::time::Duration;

use common::{STATUS_FULL, TestHandle, open_enabled, open_on, settle};
use upos_core::{DeviceError, ErrorLocus, ErrorResponse, ExclusiveUse};
use upos_runtime::{DeviceRegistry, Event, Params, RuntimeOptions};

#[tokio::test]
async fn test_freeze_holds_events_but_not_properties() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set_freeze_events(true).unwrap();

    handle.status(STATUS_FULL);
    settle().await;
    assert!(service.get_bool("Full").unwrap());
    assert!(listener.events().is_empty());

    service.set_freeze_events(false).unwrap();
    settle().await;
    assert_eq!(listener.statuses(), vec![STATUS_FULL]);
}

#[tokio::test]
async fn test_status_fans_out_to_enabled_handles() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (first, first_events) =
        open_on(&registry, "first", "shared:0", &handle, ExclusiveUse::No);
    let (second, second_events) =
        open_on(&registry, "second", "shared:0", &handle, ExclusiveUse::No);
    let (third, third_events) =
        open_on(&registry, "third", "shared:0", &handle, ExclusiveUse::No);
    first.set_device_enabled(true).unwrap();
    second.set_device_enabled(true).unwrap();

    handle.status(STATUS_FULL);
    settle().await;

    assert_eq!(first_events.statuses(), vec![STATUS_FULL]);
    assert_eq!(second_events.statuses(), vec![STATUS_FULL]);
    assert!(third_events.events().is_empty());
    assert!(third.get_bool("Full").unwrap());
}

#[tokio::test]
async fn test_data_waits_for_data_event_enabled() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;

    handle.data(42);
    handle.status(STATUS_FULL);
    settle().await;

    assert_eq!(listener.statuses(), vec![STATUS_FULL]);
    assert_eq!(service.data_count().unwrap(), 1);
    assert_eq!(service.get_int("Value").unwrap(), 0);

    service.set_data_event_enabled(true).unwrap();
    settle().await;

    let events = listener.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], Event::Data(_)));
    assert_eq!(service.get_int("Value").unwrap(), 42);
    assert_eq!(service.data_count().unwrap(), 0);
    assert!(!service.data_event_enabled().unwrap());

    service.clear_input_properties().unwrap();
    assert_eq!(service.get_int("Value").unwrap(), 0);
}

#[tokio::test]
async fn test_one_data_event_per_enable() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;

    handle.data(1);
    handle.data(2);
    service.set_data_event_enabled(true).unwrap();
    settle().await;
    assert_eq!(listener.events().len(), 1);
    assert_eq!(service.data_count().unwrap(), 1);

    service.set_data_event_enabled(true).unwrap();
    settle().await;
    assert_eq!(listener.events().len(), 2);
    assert_eq!(service.get_int("Value").unwrap(), 2);
}

#[tokio::test]
async fn test_strict_fifo_keeps_generation_order() {
    let registry = DeviceRegistry::with_options(RuntimeOptions { strict_fifo: true });
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;

    handle.data(42);
    handle.status(STATUS_FULL);
    settle().await;
    assert!(listener.events().is_empty());

    service.set_data_event_enabled(true).unwrap();
    settle().await;
    let events = listener.events();
    assert!(matches!(events[0], Event::Data(_)));
    assert_eq!(events[1], Event::Status(upos_runtime::StatusUpdate::new(STATUS_FULL)));
}

#[tokio::test]
async fn test_auto_disable_after_data() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, _listener) = open_enabled(&registry, &handle).await;
    service.set_auto_disable(true).unwrap();

    handle.data(5);
    settle().await;
    assert!(!service.device_enabled().unwrap());
    assert_eq!(handle.enables(), vec![true, false]);

    handle.data(6);
    settle().await;
    assert_eq!(service.data_count().unwrap(), 1);
}

#[tokio::test]
async fn test_disabled_handle_drops_input() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set_device_enabled(false).unwrap();

    handle.data(5);
    handle.status(STATUS_FULL);
    settle().await;
    assert_eq!(service.data_count().unwrap(), 0);
    assert!(listener.events().is_empty());
    assert!(service.get_bool("Full").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_input_request_delivers_data() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    service.set_data_event_enabled(true).unwrap();

    service
        .invoke("read", Params::new().with("value", 17))
        .await
        .unwrap()
        .unwrap();
    assert!(listener.wait_for_events(1, Duration::from_secs(1)).await);
    assert_eq!(service.get_int("Value").unwrap(), 17);
}

#[tokio::test(start_paused = true)]
async fn test_input_error_is_preceded_by_buffered_data() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;
    listener.set_response(ErrorResponse::ContinueInput);

    handle.data(1);
    settle().await;
    handle.fail_next(DeviceError::failure("Read error"));
    service
        .invoke("read", Params::new().with("value", 2))
        .await
        .unwrap();
    settle().await;
    assert!(listener.events().is_empty());

    service.set_data_event_enabled(true).unwrap();
    settle().await;
    let events = listener.events();
    assert_eq!(events.len(), 2);
    match &events[0] {
        Event::Error(error) => assert_eq!(error.locus, ErrorLocus::InputData),
        other => panic!("expected input data error, got {other:?}"),
    }
    assert!(matches!(events[1], Event::Data(_)));

    // ContinueInput does not fit a plain input error: the default applies.
    service.set_data_event_enabled(true).unwrap();
    settle().await;
    let errors = listener.errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[1].locus, ErrorLocus::Input);
    assert_eq!(service.data_count().unwrap(), 0);
    assert_eq!(service.command_count().unwrap(), 0);
    assert_eq!(service.state(), upos_core::ControlState::Idle);
}

#[tokio::test]
async fn test_clear_input_discards_buffered_data() {
    let registry = DeviceRegistry::new();
    let handle = TestHandle::new();
    let (service, listener) = open_enabled(&registry, &handle).await;

    handle.data(1);
    handle.data(2);
    settle().await;
    assert_eq!(service.data_count().unwrap(), 2);

    service.clear_input().await.unwrap();
    assert_eq!(service.data_count().unwrap(), 0);

    service.set_data_event_enabled(true).unwrap();
    settle().await;
    assert!(listener.events().is_empty());
}
