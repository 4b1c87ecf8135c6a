//! Scripted walk through every configured simulated device.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use upos_core::ExclusiveUse;
use upos_devices::bill_acceptor::DEPOSIT_COMPLETE;
use upos_devices::tone_indicator::{Tone, ToneNumber};
use upos_devices::{
    BillAcceptor, CashDrawer, MotionSensor, SimBillAcceptorHandle, SimCashDrawerHandle, SimHandle,
    SimMotionSensorHandle, SimToneIndicatorHandle, ToneIndicator,
};
use upos_runtime::Service;

/// Claim where the category requires it, then enable.
pub async fn enable(service: &Service) -> Result<()> {
    if service.exclusive_use()? == ExclusiveUse::Yes {
        service
            .claim(1000)
            .await
            .with_context(|| format!("Failed to claim {}", service.logical_name()))?;
    }
    service
        .set_device_enabled(true)
        .with_context(|| format!("Failed to enable {}", service.logical_name()))
}

/// Exercise one enabled device. The service comes back whether or not the
/// script succeeded.
pub async fn run(service: Service, handle: &SimHandle) -> (Service, Result<()>) {
    info!("Exercising {} ({})", service.logical_name(), service.category());
    match handle {
        SimHandle::CashDrawer(hand) => {
            let drawer = CashDrawer::from_service(service);
            let result = cash_drawer(&drawer, hand).await;
            (drawer.into_service(), result)
        }
        SimHandle::MotionSensor(world) => {
            let sensor = MotionSensor::from_service(service);
            let result = motion_sensor(&sensor, world).await;
            (sensor.into_service(), result)
        }
        SimHandle::ToneIndicator(speaker) => {
            let tone = ToneIndicator::from_service(service);
            let result = tone_indicator(&tone, speaker).await;
            (tone.into_service(), result)
        }
        SimHandle::BillAcceptor(customer) => {
            let acceptor = BillAcceptor::from_service(service);
            let result = bill_acceptor(&acceptor, customer).await;
            (acceptor.into_service(), result)
        }
        other => {
            warn!("No demo for {}", other.category());
            (service, Ok(()))
        }
    }
}

async fn cash_drawer(drawer: &CashDrawer, hand: &SimCashDrawerHandle) -> Result<()> {
    drawer.open_drawer().await?;
    println!("  drawer opened: {}", drawer.drawer_opened()?);
    let hand = hand.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        hand.close();
    });
    drawer.wait_for_drawer_close(500, 800, 100, 300).await?;
    println!("  drawer opened: {}", drawer.drawer_opened()?);
    Ok(())
}

async fn motion_sensor(sensor: &MotionSensor, world: &SimMotionSensorHandle) -> Result<()> {
    if sensor.timeout()? <= 0 {
        sensor.set_timeout(500)?;
    }
    world.motion();
    sensor.wait_for_motion(1000).await?;
    println!("  motion: {}", sensor.motion()?);

    world.no_motion();
    let settle = u64::try_from(sensor.timeout()?).unwrap_or(0) + 100;
    tokio::time::sleep(Duration::from_millis(settle)).await;
    println!("  motion: {}", sensor.motion()?);
    Ok(())
}

async fn tone_indicator(tone: &ToneIndicator, speaker: &SimToneIndicatorHandle) -> Result<()> {
    let a = Tone {
        pitch: 440,
        duration: 150,
        volume: 80,
    };
    tone.set_tone(ToneNumber::One, a)?;
    tone.set_tone(ToneNumber::Two, Tone { pitch: 660, ..a })?;
    tone.set_inter_tone_wait(50)?;
    tone.sound(2, 200).await?;
    for played in speaker.played() {
        println!("  played {} cycle(s) of {:?}", played.cycles, played.tones);
    }
    Ok(())
}

async fn bill_acceptor(acceptor: &BillAcceptor, customer: &SimBillAcceptorHandle) -> Result<()> {
    acceptor.set_real_time_data_enabled(true)?;
    acceptor.begin_deposit().await?;
    for bill in [1000, 2000, 1000] {
        acceptor.service().set_data_event_enabled(true)?;
        if !customer.insert(bill) {
            warn!("Bill {} refused", bill);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    acceptor.fix_deposit().await?;
    println!(
        "  deposit: {} {} {}",
        acceptor.deposit_amount()?,
        acceptor.currency_code()?,
        acceptor.deposit_counts()?
    );
    acceptor.end_deposit(DEPOSIT_COMPLETE).await?;
    Ok(())
}
