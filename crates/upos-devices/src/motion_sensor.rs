//! Motion sensor.
//!
//! "Motion present" is reported at once. "Motion absent" is held back for
//! `Timeout` milliseconds and dropped if motion is seen again meanwhile, so
//! the application only learns about absence that lasted the whole timeout.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;
use upos_core::{DeviceError, ExclusiveUse, PowerReporting, PropertyValue, Result};
use upos_runtime::schema::{CategorySchema, PropertySpec, StatusRule};
use upos_runtime::{
    Capabilities, ConfigError, DelayPolicy, DeviceBlueprint, DeviceDriver, DeviceRegistry,
    EventListener, EventSink, PropertyBag, PropertySet, PropertyState, RequestContext, Service,
};

use crate::sim::SimCore;

pub const CATEGORY: &str = "MotionSensor";

pub const STATUS_PRESENT: i32 = 1;
pub const STATUS_ABSENT: i32 = 2;

/// Category description.
pub fn schema() -> Result<CategorySchema> {
    CategorySchema::builder(CATEGORY)
        .exclusive_use(ExclusiveUse::No)
        .property(PropertySpec::read_only("Motion", false).readable_after_enable())
        .property(
            PropertySpec::read_write("Timeout", 0)
                .readable_after_enable()
                .validate(|value, _| match value.as_int() {
                    Some(v) if v > 0 => Ok(()),
                    _ => Err(DeviceError::illegal_argument(
                        "Motion timeout must be > 0",
                    )),
                }),
        )
        .status(
            StatusRule::new(STATUS_PRESENT, "Motion detected")
                .sets("Motion", true)
                .delayed(DelayPolicy::CancelOnly),
        )
        .status(
            StatusRule::new(STATUS_ABSENT, "No motion detected")
                .sets("Motion", false)
                .delayed(DelayPolicy::AfterProperty("Timeout")),
        )
        .build()
}

#[derive(Debug, Default)]
struct Shared {
    core: SimCore,
    initial_timeout: u64,
}

/// Simulated motion sensor.
#[derive(Debug)]
pub struct SimMotionSensor {
    shared: Arc<Shared>,
}

impl SimMotionSensor {
    pub fn new() -> (Self, SimMotionSensorHandle) {
        Self::with_shared(Shared::default())
    }

    /// Sensor configured from a device entry's properties.
    ///
    /// `timeout_ms` sets the initial `Timeout` of every handle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed values.
    pub fn from_properties(
        bag: &PropertyBag,
    ) -> std::result::Result<(Self, SimMotionSensorHandle), ConfigError> {
        Ok(Self::with_shared(Shared {
            initial_timeout: bag.u64_or("timeout_ms", 0)?,
            ..Shared::default()
        }))
    }

    fn with_shared(shared: Shared) -> (Self, SimMotionSensorHandle) {
        let shared = Arc::new(shared);
        let handle = SimMotionSensorHandle {
            shared: shared.clone(),
        };
        (Self { shared }, handle)
    }
}

impl DeviceDriver for SimMotionSensor {
    fn attach(&self, sink: EventSink) {
        self.shared.core.attach(sink);
    }

    fn open(&self, state: &mut PropertyState) -> Result<()> {
        state.set_capabilities(Capabilities {
            power_reporting: PowerReporting::Standard,
            ..Capabilities::default()
        });
        let timeout = i64::try_from(self.shared.initial_timeout)
            .map_err(|_| DeviceError::illegal_argument("timeout_ms too large"))?;
        state.set_value("Timeout", timeout)?;
        Ok(())
    }

    fn set_property(&self, props: &PropertySet, name: &str, value: &PropertyValue) -> Result<()> {
        debug!("{}: sensor {} <- {}", props.logical_name(), name, value);
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Err(DeviceError::unsupported(ctx.operation())) })
    }
}

/// Whatever moves in front of the simulated sensor.
#[derive(Debug, Clone)]
pub struct SimMotionSensorHandle {
    shared: Arc<Shared>,
}

impl SimMotionSensorHandle {
    pub fn motion(&self) -> bool {
        self.shared.core.status(STATUS_PRESENT)
    }

    pub fn no_motion(&self) -> bool {
        self.shared.core.status(STATUS_ABSENT)
    }
}

/// Blueprint plus control handle for a configured simulated sensor.
///
/// # Errors
///
/// Fails for malformed configuration values.
pub fn simulate(bag: &PropertyBag) -> Result<(DeviceBlueprint, SimMotionSensorHandle)> {
    let (driver, handle) = SimMotionSensor::from_properties(bag)?;
    Ok((DeviceBlueprint::new(schema()?, driver), handle))
}

/// Typed view of a motion sensor service.
#[derive(Debug)]
pub struct MotionSensor {
    service: Service,
}

impl MotionSensor {
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

    pub fn motion(&self) -> Result<bool> {
        self.service.get_bool("Motion")
    }

    /// Milliseconds absence must last before it is reported.
    pub fn timeout(&self) -> Result<i64> {
        self.service.get_int("Timeout")
    }

    pub fn set_timeout(&self, millis: i64) -> Result<()> {
        self.service.set("Timeout", millis)
    }

    /// Block until motion is present.
    ///
    /// # Errors
    ///
    /// Fails with `Timeout` if no motion is seen within `timeout_ms`.
    pub async fn wait_for_motion(&self, timeout_ms: i64) -> Result<()> {
        self.service.wait_for("Motion", true, timeout_ms).await
    }
}
