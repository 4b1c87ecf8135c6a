//! Bill acceptor deposit cycle.

mod common;

use std::sync::Arc;

use common::{expect_events, listener, settle};
use rstest::rstest;
use upos_core::{DeviceError, ErrorCode, ErrorKind, PropertyValue};
use upos_devices::bill_acceptor::{
    BillAcceptor, DEPOSIT_COMPLETE, DepositControl, DepositStatus, FULL_STATUS_OK, STATUS_JAM,
    STATUS_JAM_OK, STATUS_NEAR_FULL, SimBillAcceptor, SimBillAcceptorHandle,
};
use upos_runtime::{DeviceRegistry, Event, PropertyBag, RecordingListener};

async fn open_with(
    registry: &DeviceRegistry,
    bag: &PropertyBag,
) -> (BillAcceptor, SimBillAcceptorHandle, Arc<RecordingListener>) {
    let (driver, customer) = SimBillAcceptor::from_properties(bag).unwrap();
    let events = listener();
    let acceptor =
        BillAcceptor::open(registry, "bills", "sim:bills:0", driver, events.clone()).unwrap();
    acceptor.service().claim(0).await.unwrap();
    acceptor.service().set_device_enabled(true).unwrap();
    (acceptor, customer, events)
}

async fn open_enabled(
    registry: &DeviceRegistry,
) -> (BillAcceptor, SimBillAcceptorHandle, Arc<RecordingListener>) {
    open_with(registry, &PropertyBag::new()).await
}

#[tokio::test]
async fn test_deposit_cycle() {
    let registry = DeviceRegistry::new();
    let (acceptor, customer, _events) = open_enabled(&registry).await;
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::End);
    assert!(!customer.insert(1000));

    acceptor.begin_deposit().await.unwrap();
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::Start);
    assert!(customer.insert(1000));
    assert!(customer.insert(2000));
    assert!(customer.insert(1000));
    assert!(!customer.insert(1234));
    // Nothing is reported until the deposit is fixed.
    assert_eq!(acceptor.deposit_amount().unwrap(), 0);

    acceptor.fix_deposit().await.unwrap();
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::Count);
    assert_eq!(acceptor.deposit_amount().unwrap(), 4000);
    assert_eq!(acceptor.deposit_counts().unwrap(), ";1000:2,2000:1");
    assert!(!customer.insert(500));

    acceptor.end_deposit(DEPOSIT_COMPLETE).await.unwrap();
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::End);
    assert_eq!(acceptor.deposit_amount().unwrap(), 4000);

    acceptor.begin_deposit().await.unwrap();
    assert_eq!(acceptor.deposit_amount().unwrap(), 0);
    assert_eq!(acceptor.deposit_counts().unwrap(), "");
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Begin,
    Fix,
    End(i64),
    Pause,
}

async fn run(acceptor: &BillAcceptor, step: Step) -> upos_core::Result<()> {
    match step {
        Step::Begin => acceptor.begin_deposit().await,
        Step::Fix => acceptor.fix_deposit().await,
        Step::End(success) => acceptor.end_deposit(success).await,
        Step::Pause => acceptor.pause_deposit(DepositControl::Pause).await,
    }
}

#[rstest]
#[case::fix_before_begin(&[], Step::Fix)]
#[case::end_before_begin(&[], Step::End(DEPOSIT_COMPLETE))]
#[case::pause_before_begin(&[], Step::Pause)]
#[case::begin_twice(&[Step::Begin], Step::Begin)]
#[case::end_before_fix(&[Step::Begin], Step::End(DEPOSIT_COMPLETE))]
#[case::fix_twice(&[Step::Begin, Step::Fix], Step::Fix)]
#[case::end_with_bad_code(&[Step::Begin, Step::Fix], Step::End(12))]
#[tokio::test]
async fn test_out_of_order_calls_are_rejected(#[case] before: &[Step], #[case] step: Step) {
    let registry = DeviceRegistry::new();
    let (acceptor, _customer, _events) = open_enabled(&registry).await;
    for prior in before {
        run(&acceptor, *prior).await.unwrap();
    }
    let status = acceptor.deposit_status().unwrap();

    let error = run(&acceptor, step).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::IllegalArgument);
    assert_eq!(acceptor.deposit_status().unwrap(), status);
}

#[tokio::test]
async fn test_deposit_needs_claim() {
    let registry = DeviceRegistry::new();
    let (driver, _customer) = SimBillAcceptor::new();
    let acceptor =
        BillAcceptor::open(&registry, "bills", "sim:bills:0", driver, listener()).unwrap();
    let error = acceptor.begin_deposit().await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::NotClaimed);
}

#[tokio::test]
async fn test_pause_and_restart() {
    let registry = DeviceRegistry::new();
    let (acceptor, customer, _events) = open_enabled(&registry).await;
    acceptor.begin_deposit().await.unwrap();
    assert!(customer.insert(500));

    acceptor.pause_deposit(DepositControl::Pause).await.unwrap();
    assert!(!customer.insert(500));
    acceptor.pause_deposit(DepositControl::Restart).await.unwrap();
    assert!(customer.insert(500));

    acceptor.fix_deposit().await.unwrap();
    assert_eq!(acceptor.deposit_amount().unwrap(), 1000);
}

#[tokio::test]
async fn test_pause_needs_capability() {
    let registry = DeviceRegistry::new();
    let bag = PropertyBag::new().with("cap_pause", false);
    let (acceptor, _customer, _events) = open_with(&registry, &bag).await;
    acceptor.begin_deposit().await.unwrap();
    let error = acceptor.pause_deposit(DepositControl::Pause).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotSupported);
}

#[tokio::test]
async fn test_real_time_data() {
    let registry = DeviceRegistry::new();
    let (acceptor, customer, events) = open_enabled(&registry).await;
    acceptor.set_real_time_data_enabled(true).unwrap();
    acceptor.service().set_data_event_enabled(true).unwrap();
    acceptor.begin_deposit().await.unwrap();

    assert!(customer.insert(5000));
    expect_events(&events, 1).await;
    assert_eq!(acceptor.deposit_amount().unwrap(), 5000);
    assert!(!acceptor.service().data_event_enabled().unwrap());

    // Held until data events are enabled again.
    assert!(customer.insert(2000));
    settle().await;
    assert_eq!(events.events().len(), 1);
    assert_eq!(acceptor.service().data_count().unwrap(), 1);

    acceptor.service().set_data_event_enabled(true).unwrap();
    expect_events(&events, 2).await;
    assert_eq!(acceptor.deposit_amount().unwrap(), 7000);
    assert_eq!(acceptor.deposit_counts().unwrap(), ";2000:1,5000:1");
    match &events.events()[1] {
        Event::Data(data) => assert!(
            data.values
                .contains(&("DepositAmount".to_string(), PropertyValue::Int(7000)))
        ),
        other => panic!("expected data event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_real_time_data_needs_capability() {
    let registry = DeviceRegistry::new();
    let bag = PropertyBag::new().with("cap_real_time", "false");
    let (acceptor, customer, events) = open_with(&registry, &bag).await;
    let error = acceptor.set_real_time_data_enabled(true).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotSupported);

    acceptor.service().set_data_event_enabled(true).unwrap();
    acceptor.begin_deposit().await.unwrap();
    assert!(customer.insert(1000));
    settle().await;
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn test_jam_blocks_deposit_until_cleared() {
    let registry = DeviceRegistry::new();
    let (acceptor, customer, events) = open_enabled(&registry).await;
    acceptor.begin_deposit().await.unwrap();
    assert!(customer.insert(1000));

    customer.jam();
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::Jam);
    assert!(!customer.insert(1000));
    let error = acceptor.fix_deposit().await.unwrap_err();
    assert_eq!(error.message(), "Jam condition");
    let error = acceptor.begin_deposit().await.unwrap_err();
    assert_eq!(error.message(), "Jam condition");

    customer.clear_jam();
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::End);
    expect_events(&events, 2).await;
    assert_eq!(events.statuses(), vec![STATUS_JAM, STATUS_JAM_OK]);

    acceptor.begin_deposit().await.unwrap();
    assert!(customer.insert(1000));
    acceptor.fix_deposit().await.unwrap();
    assert_eq!(acceptor.deposit_amount().unwrap(), 1000);
}

#[tokio::test]
async fn test_stacker_level() {
    let registry = DeviceRegistry::new();
    let (acceptor, customer, _events) = open_enabled(&registry).await;
    assert_eq!(acceptor.full_status().unwrap(), FULL_STATUS_OK);

    customer.stacker(STATUS_NEAR_FULL);
    assert_eq!(acceptor.full_status().unwrap(), i64::from(STATUS_NEAR_FULL));
    customer.stacker(upos_devices::bill_acceptor::STATUS_FULL_OK);
    assert_eq!(acceptor.full_status().unwrap(), FULL_STATUS_OK);
}

#[tokio::test]
async fn test_currency_code() {
    let registry = DeviceRegistry::new();
    let bag = PropertyBag::new().with("currencies", "EUR,USD");
    let (acceptor, _customer, _events) = open_with(&registry, &bag).await;
    assert_eq!(acceptor.currency_code().unwrap(), "EUR");

    acceptor.set_currency_code("USD").unwrap();
    assert_eq!(acceptor.currency_code().unwrap(), "USD");
    let error = acceptor.set_currency_code("JPY").unwrap_err();
    assert_eq!(error.kind(), ErrorKind::IllegalArgument);
    assert_eq!(acceptor.currency_code().unwrap(), "USD");
}

#[tokio::test]
async fn test_failed_operation_keeps_status() {
    let registry = DeviceRegistry::new();
    let (acceptor, customer, _events) = open_enabled(&registry).await;
    customer.fail_next(DeviceError::offline("Acceptor offline"));

    let error = acceptor.begin_deposit().await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::Offline);
    assert_eq!(acceptor.deposit_status().unwrap(), DepositStatus::End);
    assert!(!customer.insert(1000));
}
