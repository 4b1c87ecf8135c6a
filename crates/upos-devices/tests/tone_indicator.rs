//! Tone indicator: sound timing, asynchronous sounds and clearing.

mod common;

use std::time::Duration;

use common::{expect_events, listener, settle};
use tokio::time::Instant;
use upos_core::constants::FOREVER;
use upos_core::{ControlState, DeviceError, ErrorCode, ErrorKind, WaitTimeout};
use upos_devices::tone_indicator::{
    self, STATUS_IDLE, SimToneIndicator, SimToneIndicatorHandle, Tone, ToneIndicator, ToneNumber,
};
use upos_runtime::{DeviceRegistry, Event, PropertyBag, RequestOutcome, Service};

const BEEP: Tone = Tone {
    pitch: 440,
    duration: 100,
    volume: 80,
};

const BOOP: Tone = Tone {
    pitch: 880,
    duration: 200,
    volume: 80,
};

/// Enabled tone indicator with both tones set and 50 ms between them: one
/// cycle lasts 350 ms.
fn configure(tone: &ToneIndicator) {
    tone.service().set_device_enabled(true).unwrap();
    tone.set_tone(ToneNumber::One, BEEP).unwrap();
    tone.set_tone(ToneNumber::Two, BOOP).unwrap();
    tone.set_inter_tone_wait(50).unwrap();
}

fn open_configured(registry: &DeviceRegistry) -> (ToneIndicator, SimToneIndicatorHandle) {
    let (driver, speaker) = SimToneIndicator::new();
    let tone = ToneIndicator::open(registry, "tone", "sim:tone:0", driver, listener()).unwrap();
    configure(&tone);
    (tone, speaker)
}

#[tokio::test(start_paused = true)]
async fn test_synchronous_sound() {
    let registry = DeviceRegistry::new();
    let (tone, speaker) = open_configured(&registry);
    assert_eq!(tone.tone(ToneNumber::Two).unwrap(), BOOP);

    let started = Instant::now();
    assert!(tone.sound(2, 300).await.unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(1000));

    let played = speaker.played();
    assert_eq!(played.len(), 1);
    assert_eq!(played[0].tones, [BEEP, BOOP]);
    assert_eq!(played[0].cycles, 2);
    assert!(!played[0].aborted);
}

#[tokio::test(start_paused = true)]
async fn test_silent_tone_is_skipped() {
    let registry = DeviceRegistry::new();
    let (tone, speaker) = open_configured(&registry);
    tone.set_tone(ToneNumber::Two, Tone { pitch: 0, ..BOOP }).unwrap();

    let started = Instant::now();
    tone.sound(1, 0).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));
    assert_eq!(speaker.played()[0].cycles, 1);
}

#[tokio::test]
async fn test_invalid_sound_arguments() {
    let registry = DeviceRegistry::new();
    let (tone, speaker) = open_configured(&registry);

    for (cycles, wait) in [(0, 0), (-5, 0), (1, -1), (FOREVER, 0)] {
        let error = tone.sound(cycles, wait).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::IllegalArgument, "{cycles}/{wait}");
    }
    let error = tone.set_tone(ToneNumber::One, Tone { volume: 101, ..BEEP }).unwrap_err();
    assert_eq!(error.code(), ErrorCode::Illegal);
    assert!(speaker.played().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_async_sounds_play_one_after_the_other() {
    let registry = DeviceRegistry::new();
    let (driver, speaker) = SimToneIndicator::new();
    let events = listener();
    let tone = ToneIndicator::open(&registry, "tone", "sim:tone:0", driver, events.clone()).unwrap();
    configure(&tone);
    tone.service().set_async_mode(true).unwrap();

    let started = Instant::now();
    let first = tone.sound(1, 0).await.unwrap().unwrap();
    let second = tone.sound(1, 0).await.unwrap().unwrap();
    assert_eq!(tone.service().state(), ControlState::Busy);

    let outcome = second.wait(WaitTimeout::Forever).await;
    assert_eq!(outcome, Some(RequestOutcome::Completed));
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert_eq!(first.outcome(), Some(RequestOutcome::Completed));

    expect_events(&events, 2).await;
    assert_eq!(
        events.events(),
        vec![
            Event::OutputComplete {
                output_id: first.output_id()
            },
            Event::OutputComplete {
                output_id: second.output_id()
            },
        ]
    );
    let ids: Vec<_> = speaker.played().iter().map(|p| p.output_id).collect();
    assert_eq!(ids, vec![first.output_id(), second.output_id()]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_hardware_mixes_sounds() {
    let registry = DeviceRegistry::new();
    let bag = PropertyBag::new().with("concurrent", true);
    let (blueprint, speaker) = match upos_devices::simulate(tone_indicator::CATEGORY, &bag).unwrap()
    {
        (blueprint, upos_devices::SimHandle::ToneIndicator(speaker)) => (blueprint, speaker),
        (_, other) => panic!("unexpected handle {other:?}"),
    };
    let service =
        Service::open(&registry, "tone", "sim:tone:0", move || Ok(blueprint), listener()).unwrap();
    let tone = ToneIndicator::from_service(service);
    configure(&tone);
    tone.service().set_async_mode(true).unwrap();

    let started = Instant::now();
    let first = tone.sound(1, 0).await.unwrap().unwrap();
    let second = tone.sound(1, 0).await.unwrap().unwrap();
    first.wait(WaitTimeout::Forever).await;
    second.wait(WaitTimeout::Forever).await;
    assert!(started.elapsed() < Duration::from_millis(700));
    assert_eq!(speaker.played().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_endless_sound_until_cleared() {
    let registry = DeviceRegistry::new();
    let (driver, speaker) = SimToneIndicator::new();
    let events = listener();
    let tone = ToneIndicator::open(&registry, "tone", "sim:tone:0", driver, events.clone()).unwrap();
    configure(&tone);
    tone.service().set_async_mode(true).unwrap();

    let endless = tone.sound(FOREVER, 100).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(endless.outcome().is_none());

    tone.service().clear_output().await.unwrap();
    assert_eq!(endless.outcome(), Some(RequestOutcome::Aborted));
    assert_eq!(tone.service().state(), ControlState::Idle);

    let played = speaker.played();
    assert_eq!(played.len(), 1);
    assert!(played[0].aborted);
    assert_eq!(played[0].cycles, 2);
    settle().await;
    assert!(events.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sound_immediate_drops_queued_sounds() {
    let registry = DeviceRegistry::new();
    let (tone, speaker) = open_configured(&registry);
    tone.service().set_async_mode(true).unwrap();

    let endless = tone.sound(FOREVER, 0).await.unwrap().unwrap();
    let queued = tone.sound(3, 0).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    tone.sound_immediate().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(350));
    assert_eq!(endless.outcome(), Some(RequestOutcome::Aborted));
    assert_eq!(queued.outcome(), Some(RequestOutcome::Aborted));

    let played = speaker.played();
    assert_eq!(played.len(), 2);
    assert!(played[0].aborted);
    assert_eq!(played[1].cycles, 1);
    assert!(!played[1].aborted);
}

#[tokio::test(start_paused = true)]
async fn test_idle_status_after_last_sound() {
    let registry = DeviceRegistry::new();
    let (driver, _speaker) = SimToneIndicator::new();
    let events = listener();
    let tone = ToneIndicator::open(&registry, "tone", "sim:tone:0", driver, events.clone()).unwrap();
    configure(&tone);
    tone.service().set_async_mode(true).unwrap();

    let request = tone.sound(2, 0).await.unwrap().unwrap();
    tone.service().set_flag_when_idle(true).unwrap();
    request.wait(WaitTimeout::Forever).await;

    expect_events(&events, 2).await;
    assert_eq!(events.statuses(), vec![STATUS_IDLE]);
    assert!(!tone.service().flag_when_idle().unwrap());

    // Already idle: the status fires at once.
    tone.service().set_flag_when_idle(true).unwrap();
    expect_events(&events, 3).await;
    assert_eq!(events.statuses(), vec![STATUS_IDLE, STATUS_IDLE]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_async_sound_reports_error() {
    let registry = DeviceRegistry::new();
    let (driver, speaker) = SimToneIndicator::new();
    let events = listener();
    let tone = ToneIndicator::open(&registry, "tone", "sim:tone:0", driver, events.clone()).unwrap();
    configure(&tone);
    tone.service().set_async_mode(true).unwrap();

    speaker.fail_next(DeviceError::failure("Speaker disconnected"));
    let request = tone.sound(1, 0).await.unwrap().unwrap();
    request.wait(WaitTimeout::Forever).await;
    expect_events(&events, 1).await;

    let errors = events.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorCode::Failure);
    // The recording listener answers with Clear.
    settle().await;
    assert_eq!(tone.service().state(), ControlState::Idle);
}
