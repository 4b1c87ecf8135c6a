//! Motion sensor: delayed absence and blocking waits.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{expect_events, listener, settle};
use upos_core::{ErrorCode, ErrorKind};
use upos_devices::motion_sensor::{
    MotionSensor, STATUS_ABSENT, STATUS_PRESENT, SimMotionSensor, SimMotionSensorHandle,
};
use upos_runtime::{DeviceRegistry, PropertyBag, RecordingListener};

fn open_enabled(
    registry: &DeviceRegistry,
    timeout_ms: i64,
) -> (MotionSensor, SimMotionSensorHandle, Arc<RecordingListener>) {
    let (driver, world) = SimMotionSensor::new();
    let events = listener();
    let sensor =
        MotionSensor::open(registry, "motion", "sim:motion:0", driver, events.clone()).unwrap();
    sensor.service().set_device_enabled(true).unwrap();
    if timeout_ms > 0 {
        sensor.set_timeout(timeout_ms).unwrap();
    }
    (sensor, world, events)
}

#[tokio::test(start_paused = true)]
async fn test_absence_is_reported_after_timeout() {
    let registry = DeviceRegistry::new();
    let (sensor, world, events) = open_enabled(&registry, 2000);

    assert!(world.motion());
    assert!(sensor.motion().unwrap());
    expect_events(&events, 1).await;

    assert!(world.no_motion());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    settle().await;
    assert!(sensor.motion().unwrap());
    assert_eq!(events.statuses(), vec![STATUS_PRESENT]);

    tokio::time::sleep(Duration::from_millis(600)).await;
    expect_events(&events, 2).await;
    assert!(!sensor.motion().unwrap());
    assert_eq!(events.statuses(), vec![STATUS_PRESENT, STATUS_ABSENT]);
}

#[tokio::test(start_paused = true)]
async fn test_short_absence_is_swallowed() {
    let registry = DeviceRegistry::new();
    let (sensor, world, events) = open_enabled(&registry, 2000);

    world.motion();
    expect_events(&events, 1).await;
    world.no_motion();
    tokio::time::sleep(Duration::from_millis(500)).await;
    world.motion();

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert!(sensor.motion().unwrap());
    assert_eq!(events.statuses(), vec![STATUS_PRESENT]);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_motion() {
    let registry = DeviceRegistry::new();
    let (sensor, world, _events) = open_enabled(&registry, 1000);

    let error = sensor.wait_for_motion(300).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert_eq!(error.code(), ErrorCode::Timeout);

    let mover = world.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        mover.motion();
    });
    sensor.wait_for_motion(1000).await.unwrap();
    assert!(sensor.motion().unwrap());

    // Already present: no waiting.
    sensor.wait_for_motion(0).await.unwrap();
}

#[tokio::test]
async fn test_timeout_must_be_positive() {
    let registry = DeviceRegistry::new();
    let (sensor, _world, _events) = open_enabled(&registry, 0);

    for millis in [0, -100] {
        let error = sensor.set_timeout(millis).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::IllegalArgument);
    }
    sensor.set_timeout(250).unwrap();
    assert_eq!(sensor.timeout().unwrap(), 250);
}

#[tokio::test]
async fn test_configured_timeout() {
    let registry = DeviceRegistry::new();
    let bag = PropertyBag::new().with("timeout_ms", 1500);
    let (driver, _world) = SimMotionSensor::from_properties(&bag).unwrap();
    let sensor =
        MotionSensor::open(&registry, "motion", "sim:motion:0", driver, listener()).unwrap();
    sensor.service().set_device_enabled(true).unwrap();
    assert_eq!(sensor.timeout().unwrap(), 1500);
}

#[tokio::test(start_paused = true)]
async fn test_handles_keep_their_own_timeout() {
    let registry = DeviceRegistry::new();
    let (sensor, world, fast_events) = open_enabled(&registry, 500);
    let (unused, _) = SimMotionSensor::new();
    let slow_events = listener();
    let slow =
        MotionSensor::open(&registry, "slow", "sim:motion:0", unused, slow_events.clone()).unwrap();
    slow.service().set_device_enabled(true).unwrap();
    slow.set_timeout(3000).unwrap();

    world.motion();
    expect_events(&fast_events, 1).await;
    expect_events(&slow_events, 1).await;

    world.no_motion();
    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert!(!sensor.motion().unwrap());
    assert!(slow.motion().unwrap());

    tokio::time::sleep(Duration::from_secs(3)).await;
    expect_events(&slow_events, 2).await;
    assert!(!slow.motion().unwrap());
    assert_eq!(fast_events.statuses(), slow_events.statuses());
}

#[tokio::test]
async fn test_disabled_sensor_reports_nothing() {
    let registry = DeviceRegistry::new();
    let (driver, world) = SimMotionSensor::new();
    assert!(!world.motion());

    let events = listener();
    let sensor =
        MotionSensor::open(&registry, "motion", "sim:motion:0", driver, events.clone()).unwrap();
    assert!(world.motion());
    settle().await;
    assert!(events.statuses().is_empty());

    let error = sensor.motion().unwrap_err();
    assert_eq!(error.code(), ErrorCode::Illegal);
}
