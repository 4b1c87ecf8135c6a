//! Bill acceptor.
//!
//! A deposit runs through `beginDeposit` (bills are accepted), `fixDeposit`
//! (acceptance stops, `DepositAmount` and `DepositCounts` are final) and
//! `endDeposit`. A jam moves `DepositStatus` to [`DepositStatus::Jam`] and
//! blocks every deposit operation until the jam is cleared, which ends the
//! interrupted deposit; the amount counted up to the jam stays visible
//! through the last real-time data event.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, info};
use upos_core::{DeviceError, ExclusiveUse, PowerReporting, PropertyValue, Result};
use upos_runtime::schema::{
    CategorySchema, OperationSpec, ParamSpec, Precondition, PropertySpec, StatusRule,
};
use upos_runtime::{
    Capabilities, ConfigError, DataEvent, DeviceBlueprint, DeviceDriver, DeviceRegistry,
    EventListener, EventSink, Params, PropertyBag, PropertySet, PropertyState, RequestContext,
    Service,
};

use crate::sim::{SimCore, lock};

pub const CATEGORY: &str = "BillAcceptor";

pub const STATUS_FULL: i32 = 21;
pub const STATUS_NEAR_FULL: i32 = 22;
pub const STATUS_FULL_OK: i32 = 23;
pub const STATUS_JAM: i32 = 31;
pub const STATUS_JAM_OK: i32 = 32;

/// `FullStatus` while the stacker is below its limits.
pub const FULL_STATUS_OK: i64 = 0;

/// `endDeposit` success code.
pub const DEPOSIT_COMPLETE: i64 = 11;

pub const DEPOSIT_PAUSE: i64 = 11;
pub const DEPOSIT_RESTART: i64 = 12;

/// Value of `DepositStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepositStatus {
    Start = 1,
    End = 2,
    None = 3,
    Count = 4,
    Jam = 5,
}

impl DepositStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Start),
            2 => Some(Self::End),
            3 => Some(Self::None),
            4 => Some(Self::Count),
            5 => Some(Self::Jam),
            _ => None,
        }
    }

    fn of(state: &PropertyState) -> Option<Self> {
        state.int("DepositStatus").and_then(Self::from_i64)
    }
}

impl From<DepositStatus> for PropertyValue {
    fn from(status: DepositStatus) -> Self {
        PropertyValue::Int(status as i64)
    }
}

/// Argument of `pauseDeposit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositControl {
    Pause,
    Restart,
}

impl DepositControl {
    fn code(self) -> i64 {
        match self {
            Self::Pause => DEPOSIT_PAUSE,
            Self::Restart => DEPOSIT_RESTART,
        }
    }
}

fn expect_status(state: &PropertyState, expected: DepositStatus, otherwise: &str) -> Result<()> {
    match DepositStatus::of(state) {
        Some(status) if status == expected => Ok(()),
        Some(DepositStatus::Jam) => Err(DeviceError::illegal_argument("Jam condition")),
        _ => Err(DeviceError::illegal_argument(otherwise)),
    }
}

/// Category description.
pub fn schema() -> Result<CategorySchema> {
    CategorySchema::builder(CATEGORY)
        .exclusive_use(ExclusiveUse::Yes)
        .property(PropertySpec::read_only("CapDiscrepancy", false))
        .property(PropertySpec::read_only("CapFullSensor", true))
        .property(PropertySpec::read_only("CapJamSensor", true))
        .property(PropertySpec::read_only("CapNearFullSensor", true))
        .property(PropertySpec::read_only("CapPauseDeposit", true))
        .property(PropertySpec::read_only("CapRealTimeData", true))
        .property(PropertySpec::read_only("DepositCodeList", "EUR"))
        .property(
            PropertySpec::read_write("CurrencyCode", "EUR")
                .requires(Precondition::Opened)
                .validate(|value, state| {
                    let allowed = state.text("DepositCodeList").unwrap_or_default();
                    match value.as_text() {
                        Some(code) if allowed.split(',').any(|c| c == code) => Ok(()),
                        _ => Err(DeviceError::illegal_argument(format!(
                            "Currency code {value} not in {{{allowed}}}"
                        ))),
                    }
                }),
        )
        .property(PropertySpec::read_only("DepositAmount", 0).input_data())
        .property(PropertySpec::read_only("DepositCounts", "").input_data())
        .property(PropertySpec::read_only("DepositCashList", ""))
        .property(
            PropertySpec::read_only("DepositStatus", DepositStatus::End).readable_after_enable(),
        )
        .property(PropertySpec::read_only("FullStatus", FULL_STATUS_OK).readable_after_enable())
        .property(
            PropertySpec::read_write("RealTimeDataEnabled", false)
                .readable_after_enable()
                .gated_by("CapRealTimeData"),
        )
        .operation(OperationSpec::output("beginDeposit").check(|_, state| {
            expect_status(state, DepositStatus::End, "Just in deposit operation")
        }))
        .operation(OperationSpec::output("fixDeposit").check(|_, state| {
            match DepositStatus::of(state) {
                Some(DepositStatus::End) => {
                    Err(DeviceError::illegal_argument("Operation not started"))
                }
                _ => expect_status(state, DepositStatus::Start, "Operation just fixed"),
            }
        }))
        .operation(
            OperationSpec::output("endDeposit")
                .param(ParamSpec::int("success").one_of(&[DEPOSIT_COMPLETE]))
                .check(|_, state| {
                    expect_status(state, DepositStatus::Count, "Operation not fixed")
                }),
        )
        .operation(
            OperationSpec::output("pauseDeposit")
                .gated_by("CapPauseDeposit")
                .param(ParamSpec::int("control").one_of(&[DEPOSIT_PAUSE, DEPOSIT_RESTART]))
                .check(|params, state| {
                    if params.int("control") == Some(DEPOSIT_PAUSE)
                        && DepositStatus::of(state) == Some(DepositStatus::End)
                    {
                        return Err(DeviceError::illegal_argument("No pending deposit operation"));
                    }
                    Ok(())
                }),
        )
        .status(StatusRule::new(STATUS_FULL, "BillAcceptor Slot Full").sets("FullStatus", 21))
        .status(
            StatusRule::new(STATUS_NEAR_FULL, "BillAcceptor Slot Nearly Full")
                .sets("FullStatus", 22),
        )
        .status(
            StatusRule::new(STATUS_FULL_OK, "BillAcceptor Slot Under Limit")
                .sets("FullStatus", FULL_STATUS_OK),
        )
        .status(
            StatusRule::new(STATUS_JAM, "BillAcceptor Status Jam")
                .sets("DepositStatus", DepositStatus::Jam),
        )
        .status(
            StatusRule::new(STATUS_JAM_OK, "BillAcceptor Status No Jam")
                .sets("DepositStatus", DepositStatus::End),
        )
        .build()
}

/// Bills counted in the running deposit, by denomination.
#[derive(Debug, Default)]
struct Deposit {
    accepting: bool,
    paused: bool,
    jammed: bool,
    real_time: bool,
    bills: BTreeMap<i64, u32>,
}

impl Deposit {
    fn amount(&self) -> i64 {
        self.bills
            .iter()
            .map(|(value, count)| value * i64::from(*count))
            .sum()
    }

    /// `";value:count,value:count"`, bills only.
    fn counts(&self) -> String {
        let bills: Vec<_> = self
            .bills
            .iter()
            .map(|(value, count)| format!("{value}:{count}"))
            .collect();
        format!(";{}", bills.join(","))
    }
}

#[derive(Debug, Default)]
struct Shared {
    core: SimCore,
    deposit: Mutex<Deposit>,
    currencies: String,
    denominations: Vec<i64>,
    cap_pause: bool,
    cap_real_time: bool,
}

/// Simulated bill acceptor.
#[derive(Debug)]
pub struct SimBillAcceptor {
    shared: Arc<Shared>,
}

impl Shared {
    /// EUR notes from 5 to 500.
    fn euro() -> Self {
        Self {
            currencies: "EUR".to_string(),
            denominations: vec![500, 1000, 2000, 5000, 10000, 20000, 50000],
            cap_pause: true,
            cap_real_time: true,
            ..Self::default()
        }
    }
}

impl SimBillAcceptor {
    /// Acceptor for EUR notes from 5 to 500.
    pub fn new() -> (Self, SimBillAcceptorHandle) {
        Self::with_shared(Shared::euro())
    }

    /// Acceptor configured from a device entry's properties.
    ///
    /// Known keys: `currencies` (comma separated codes), `cap_pause` and
    /// `cap_real_time`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed values.
    pub fn from_properties(
        bag: &PropertyBag,
    ) -> std::result::Result<(Self, SimBillAcceptorHandle), ConfigError> {
        let defaults = Shared::euro();
        Ok(Self::with_shared(Shared {
            currencies: bag
                .get_str("currencies")
                .map_or(defaults.currencies, str::to_string),
            cap_pause: bag.bool_or("cap_pause", defaults.cap_pause)?,
            cap_real_time: bag.bool_or("cap_real_time", defaults.cap_real_time)?,
            denominations: defaults.denominations,
            ..Shared::default()
        }))
    }

    fn with_shared(shared: Shared) -> (Self, SimBillAcceptorHandle) {
        let shared = Arc::new(shared);
        let handle = SimBillAcceptorHandle {
            shared: shared.clone(),
        };
        (Self { shared }, handle)
    }

    fn cash_list(&self) -> String {
        let bills: Vec<_> = self
            .shared
            .denominations
            .iter()
            .map(i64::to_string)
            .collect();
        format!(";{}", bills.join(","))
    }
}

impl DeviceDriver for SimBillAcceptor {
    fn attach(&self, sink: EventSink) {
        self.shared.core.attach(sink);
    }

    fn open(&self, state: &mut PropertyState) -> Result<()> {
        state.set_capabilities(Capabilities {
            power_reporting: PowerReporting::Standard,
            ..Capabilities::default()
        });
        let first = self
            .shared
            .currencies
            .split(',')
            .next()
            .unwrap_or_default()
            .to_string();
        state.set_value("DepositCodeList", self.shared.currencies.as_str())?;
        state.set_value("CurrencyCode", first)?;
        state.set_value("DepositCashList", self.cash_list())?;
        state.set_value("CapPauseDeposit", self.shared.cap_pause)?;
        state.set_value("CapRealTimeData", self.shared.cap_real_time)?;
        if lock(&self.shared.deposit).jammed {
            state.set_value("DepositStatus", DepositStatus::Jam)?;
        }
        Ok(())
    }

    fn set_property(&self, props: &PropertySet, name: &str, value: &PropertyValue) -> Result<()> {
        if name == "RealTimeDataEnabled" {
            lock(&self.shared.deposit).real_time = value.as_bool().unwrap_or(false);
        }
        debug!("{}: acceptor {} <- {}", props.logical_name(), name, value);
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.shared.core.take_failure()?;
            let props = ctx.property_set();
            match ctx.operation() {
                "beginDeposit" => {
                    {
                        let mut deposit = lock(&self.shared.deposit);
                        deposit.bills.clear();
                        deposit.accepting = true;
                        deposit.paused = false;
                    }
                    props.update(|s| -> Result<()> {
                        s.set_value("DepositStatus", DepositStatus::Start)?;
                        s.set_value("DepositAmount", 0)?;
                        s.set_value("DepositCounts", "")?;
                        Ok(())
                    })
                }
                "fixDeposit" => {
                    let (amount, counts) = {
                        let mut deposit = lock(&self.shared.deposit);
                        deposit.accepting = false;
                        (deposit.amount(), deposit.counts())
                    };
                    info!("{}: deposit fixed at {}", props.logical_name(), amount);
                    props.update(|s| -> Result<()> {
                        s.set_value("DepositStatus", DepositStatus::Count)?;
                        s.set_value("DepositAmount", amount)?;
                        s.set_value("DepositCounts", counts)?;
                        Ok(())
                    })
                }
                "endDeposit" => {
                    lock(&self.shared.deposit).bills.clear();
                    props.update(|s| s.set_value("DepositStatus", DepositStatus::End))?;
                    Ok(())
                }
                "pauseDeposit" => {
                    let pause = ctx.params().int("control") == Some(DEPOSIT_PAUSE);
                    lock(&self.shared.deposit).paused = pause;
                    Ok(())
                }
                other => Err(DeviceError::unsupported(other)),
            }
        })
    }
}

/// Customer side of a simulated bill acceptor.
#[derive(Debug, Clone)]
pub struct SimBillAcceptorHandle {
    shared: Arc<Shared>,
}

impl SimBillAcceptorHandle {
    /// Feed one bill of `value` minor units.
    ///
    /// Returns `false` if the bill is refused: no deposit running, deposit
    /// paused, acceptor jammed or unknown denomination.
    pub fn insert(&self, value: i64) -> bool {
        let event = {
            let mut deposit = lock(&self.shared.deposit);
            if !deposit.accepting
                || deposit.paused
                || deposit.jammed
                || !self.shared.denominations.contains(&value)
            {
                return false;
            }
            *deposit.bills.entry(value).or_insert(0) += 1;
            deposit.real_time.then(|| {
                DataEvent::new(0)
                    .with("DepositAmount", deposit.amount())
                    .with("DepositCounts", deposit.counts())
            })
        };
        if let Some(event) = event {
            self.shared.core.data(event);
        }
        true
    }

    /// Jam the transport. The running deposit stops accepting bills.
    pub fn jam(&self) {
        {
            let mut deposit = lock(&self.shared.deposit);
            deposit.jammed = true;
            deposit.accepting = false;
        }
        self.shared.core.status(STATUS_JAM);
    }

    pub fn clear_jam(&self) {
        {
            let mut deposit = lock(&self.shared.deposit);
            deposit.jammed = false;
            deposit.bills.clear();
        }
        self.shared.core.status(STATUS_JAM_OK);
    }

    /// Report the stacker level: one of [`STATUS_FULL`],
    /// [`STATUS_NEAR_FULL`] and [`STATUS_FULL_OK`].
    pub fn stacker(&self, status: i32) {
        self.shared.core.status(status);
    }

    /// Make the next deposit operation fail with `error`.
    pub fn fail_next(&self, error: DeviceError) {
        self.shared.core.fail_next(error);
    }
}

/// Blueprint plus control handle for a configured simulated acceptor.
///
/// # Errors
///
/// Fails for malformed configuration values.
pub fn simulate(bag: &PropertyBag) -> Result<(DeviceBlueprint, SimBillAcceptorHandle)> {
    let (driver, handle) = SimBillAcceptor::from_properties(bag)?;
    Ok((DeviceBlueprint::new(schema()?, driver), handle))
}

/// Typed view of a bill acceptor service.
#[derive(Debug)]
pub struct BillAcceptor {
    service: Service,
}

impl BillAcceptor {
    /// Open a handle on `physical_id`, creating the device from `driver` if
    /// it is not open yet.
    ///
    /// # Errors
    ///
    /// Fails if the device cannot be opened.
    pub fn open(
        registry: &DeviceRegistry,
        logical_name: &str,
        physical_id: &str,
        driver: impl DeviceDriver,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        let service = Service::open(
            registry,
            logical_name,
            physical_id,
            || Ok(DeviceBlueprint::new(schema()?, driver)),
            listener,
        )?;
        Ok(Self::from_service(service))
    }

    pub fn from_service(service: Service) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn into_service(self) -> Service {
        self.service
    }

    pub fn deposit_status(&self) -> Result<DepositStatus> {
        let value = self.service.get_int("DepositStatus")?;
        DepositStatus::from_i64(value)
            .ok_or_else(|| DeviceError::failure(format!("Invalid DepositStatus {value}")))
    }

    /// Amount in minor units.
    pub fn deposit_amount(&self) -> Result<i64> {
        self.service.get_int("DepositAmount")
    }

    pub fn deposit_counts(&self) -> Result<String> {
        let value = self.service.get("DepositCounts")?;
        Ok(value.as_text().unwrap_or_default().to_string())
    }

    pub fn full_status(&self) -> Result<i64> {
        self.service.get_int("FullStatus")
    }

    pub fn currency_code(&self) -> Result<String> {
        let value = self.service.get("CurrencyCode")?;
        Ok(value.as_text().unwrap_or_default().to_string())
    }

    pub fn set_currency_code(&self, code: &str) -> Result<()> {
        self.service.set("CurrencyCode", code)
    }

    pub fn set_real_time_data_enabled(&self, enabled: bool) -> Result<()> {
        self.service.set("RealTimeDataEnabled", enabled)
    }

    pub async fn begin_deposit(&self) -> Result<()> {
        self.service.invoke("beginDeposit", Params::new()).await?;
        Ok(())
    }

    pub async fn fix_deposit(&self) -> Result<()> {
        self.service.invoke("fixDeposit", Params::new()).await?;
        Ok(())
    }

    /// Finish a fixed deposit. `success` must be [`DEPOSIT_COMPLETE`].
    pub async fn end_deposit(&self, success: i64) -> Result<()> {
        let params = Params::new().with("success", success);
        self.service.invoke("endDeposit", params).await?;
        Ok(())
    }

    pub async fn pause_deposit(&self, control: DepositControl) -> Result<()> {
        let params = Params::new().with("control", control.code());
        self.service.invoke("pauseDeposit", params).await?;
        Ok(())
    }
}
