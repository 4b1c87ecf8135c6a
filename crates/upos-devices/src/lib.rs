//! Device categories on top of `upos-runtime`.
//!
//! Each module holds one category: its [`CategorySchema`](upos_runtime::CategorySchema),
//! a typed façade over [`Service`] and a simulated driver whose handle plays
//! the part of the hardware (a hand closing the drawer, a customer feeding
//! bills). [`simulate`] builds a simulated device for a configured category
//! name.

pub mod bill_acceptor;
pub mod cash_drawer;
pub mod motion_sensor;
mod sim;
pub mod tone_indicator;

use std::sync::Arc;

use upos_core::{DeviceError, Result};
use upos_runtime::{
    ConfigError, DeviceBlueprint, DeviceEntry, DeviceRegistry, EventListener, PropertyBag,
    Service,
};

pub use bill_acceptor::{BillAcceptor, SimBillAcceptor, SimBillAcceptorHandle};
pub use cash_drawer::{CashDrawer, SimCashDrawer, SimCashDrawerHandle};
pub use motion_sensor::{MotionSensor, SimMotionSensor, SimMotionSensorHandle};
pub use tone_indicator::{SimToneIndicator, SimToneIndicatorHandle, ToneIndicator};

/// Category names [`simulate`] knows.
pub const CATEGORIES: [&str; 4] = [
    bill_acceptor::CATEGORY,
    cash_drawer::CATEGORY,
    motion_sensor::CATEGORY,
    tone_indicator::CATEGORY,
];

/// Control handle of any simulated device.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SimHandle {
    BillAcceptor(SimBillAcceptorHandle),
    CashDrawer(SimCashDrawerHandle),
    MotionSensor(SimMotionSensorHandle),
    ToneIndicator(SimToneIndicatorHandle),
}

impl SimHandle {
    pub fn category(&self) -> &'static str {
        match self {
            Self::BillAcceptor(_) => bill_acceptor::CATEGORY,
            Self::CashDrawer(_) => cash_drawer::CATEGORY,
            Self::MotionSensor(_) => motion_sensor::CATEGORY,
            Self::ToneIndicator(_) => tone_indicator::CATEGORY,
        }
    }
}

/// Simulated device of `category`, configured from `bag`.
///
/// # Errors
///
/// Fails for unknown categories and malformed configuration values.
pub fn simulate(category: &str, bag: &PropertyBag) -> Result<(DeviceBlueprint, SimHandle)> {
    match category {
        bill_acceptor::CATEGORY => {
            let (blueprint, handle) = bill_acceptor::simulate(bag)?;
            Ok((blueprint, SimHandle::BillAcceptor(handle)))
        }
        cash_drawer::CATEGORY => {
            let (blueprint, handle) = cash_drawer::simulate(bag)?;
            Ok((blueprint, SimHandle::CashDrawer(handle)))
        }
        motion_sensor::CATEGORY => {
            let (blueprint, handle) = motion_sensor::simulate(bag)?;
            Ok((blueprint, SimHandle::MotionSensor(handle)))
        }
        tone_indicator::CATEGORY => {
            let (blueprint, handle) = tone_indicator::simulate(bag)?;
            Ok((blueprint, SimHandle::ToneIndicator(handle)))
        }
        other => Err(ConfigError::UnknownCategory(other.to_string()).into()),
    }
}

/// Open a handle for a configured device entry on a simulated device.
///
/// The returned [`SimHandle`] drives the device only when this call created
/// it. A second entry on the same physical id shares the first device.
///
/// # Errors
///
/// Fails if the entry cannot be simulated or the device cannot be opened.
pub async fn open_simulated(
    registry: &DeviceRegistry,
    entry: &DeviceEntry,
    listener: Arc<dyn EventListener>,
) -> Result<(Service, SimHandle)> {
    let (blueprint, handle) = simulate(&entry.category, &entry.properties)?;
    let service = Service::open(
        registry,
        &entry.logical_name,
        &entry.physical_id,
        move || Ok(blueprint),
        listener,
    )?;
    if service.category() != handle.category() {
        let error = DeviceError::illegal_argument(format!(
            "{}: {} is already open as {}",
            entry.logical_name,
            entry.physical_id,
            service.category()
        ));
        service.close().await?;
        return Err(error);
    }
    Ok((service, handle))
}
