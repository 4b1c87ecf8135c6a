//! Cash drawer.
//!
//! The drawer is opened by the application and closed by hand. Every open
//! handle sees the drawer state through `DrawerOpened`, and
//! [`CashDrawer::wait_for_drawer_close`] blocks until somebody pushes the
//! drawer shut, beeping while it waits.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use upos_devices::cash_drawer::{CashDrawer, SimCashDrawer};
//! use upos_runtime::{DeviceRegistry, NullListener};
//!
//! #[tokio::main]
//! async fn main() -> upos_core::Result<()> {
//!     let registry = DeviceRegistry::new();
//!     let (driver, hand) = SimCashDrawer::new();
//!     let listener = Arc::new(NullListener);
//!     let drawer = CashDrawer::open(&registry, "drawer", "sim:drawer:0", driver, listener)?;
//!
//!     drawer.service().set_device_enabled(true)?;
//!     drawer.open_drawer().await?;
//!     assert!(drawer.drawer_opened()?);
//!
//!     hand.close();
//!     assert!(!drawer.drawer_opened()?);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info};
use upos_core::constants::FOREVER;
use upos_core::{DeviceError, ExclusiveUse, PowerReporting, Result};
use upos_runtime::schema::{CategorySchema, OperationSpec, Precondition, PropertySpec, StatusRule};
use upos_runtime::{
    Capabilities, ConfigError, DeviceBlueprint, DeviceDriver, DeviceRegistry, EventListener,
    EventSink, Params, PropertyBag, PropertyState, RequestContext, Service,
};

use crate::sim::SimCore;

pub const CATEGORY: &str = "CashDrawer";

pub const STATUS_CLOSED: i32 = 0;
pub const STATUS_OPEN: i32 = 1;

/// Category description.
pub fn schema() -> Result<CategorySchema> {
    CategorySchema::builder(CATEGORY)
        .exclusive_use(ExclusiveUse::Allowed)
        .property(PropertySpec::read_only("CapStatus", true))
        .property(PropertySpec::read_only("CapStatusMultiDrawerDetect", false))
        .property(PropertySpec::read_only("DrawerOpened", false).readable_after_enable())
        .operation(OperationSpec::output("openDrawer").requires(Precondition::EnabledUnclaimed))
        .status(StatusRule::new(STATUS_CLOSED, "Drawer Closed").sets("DrawerOpened", false))
        .status(StatusRule::new(STATUS_OPEN, "Drawer Opened").sets("DrawerOpened", true))
        .build()
}

#[derive(Debug, Default)]
struct Shared {
    core: SimCore,
    opened: AtomicBool,
    open_count: AtomicUsize,
    open_delay: Duration,
    auto_close: Option<Duration>,
    cap_status: bool,
}

impl Shared {
    fn close(&self) -> bool {
        if self.opened.swap(false, Ordering::SeqCst) {
            self.core.status(STATUS_CLOSED)
        } else {
            false
        }
    }
}

/// Simulated cash drawer.
#[derive(Debug)]
pub struct SimCashDrawer {
    shared: Arc<Shared>,
}

impl SimCashDrawer {
    /// Drawer that opens at once and stays open until closed by hand.
    pub fn new() -> (Self, SimCashDrawerHandle) {
        Self::with_shared(Shared {
            cap_status: true,
            ..Shared::default()
        })
    }

    /// Drawer configured from a device entry's properties.
    ///
    /// Known keys: `open_delay_ms`, `auto_close_ms` and `cap_status`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed values.
    pub fn from_properties(
        bag: &PropertyBag,
    ) -> std::result::Result<(Self, SimCashDrawerHandle), ConfigError> {
        Ok(Self::with_shared(Shared {
            open_delay: Duration::from_millis(bag.u64_or("open_delay_ms", 0)?),
            auto_close: bag.get_u64("auto_close_ms")?.map(Duration::from_millis),
            cap_status: bag.bool_or("cap_status", true)?,
            ..Shared::default()
        }))
    }

    fn with_shared(shared: Shared) -> (Self, SimCashDrawerHandle) {
        let shared = Arc::new(shared);
        let handle = SimCashDrawerHandle {
            shared: shared.clone(),
        };
        (Self { shared }, handle)
    }
}

impl DeviceDriver for SimCashDrawer {
    fn attach(&self, sink: EventSink) {
        self.shared.core.attach(sink);
    }

    fn open(&self, state: &mut PropertyState) -> Result<()> {
        state.set_capabilities(Capabilities {
            power_reporting: PowerReporting::Standard,
            ..Capabilities::default()
        });
        state.set_value("CapStatus", self.shared.cap_status)?;
        state.set_value("DrawerOpened", self.shared.opened.load(Ordering::SeqCst))?;
        Ok(())
    }

    fn execute<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match ctx.operation() {
                "openDrawer" => {
                    if !self.shared.open_delay.is_zero() && !ctx.sleep(self.shared.open_delay).await
                    {
                        return Err(DeviceError::aborted("openDrawer"));
                    }
                    self.shared.core.take_failure()?;
                    self.shared.open_count.fetch_add(1, Ordering::SeqCst);
                    if !self.shared.opened.swap(true, Ordering::SeqCst) {
                        self.shared.core.status(STATUS_OPEN);
                    }
                    if let Some(delay) = self.shared.auto_close {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            shared.close();
                        });
                    }
                    Ok(())
                }
                other => Err(DeviceError::unsupported(other)),
            }
        })
    }
}

/// The hand that closes the simulated drawer.
#[derive(Debug, Clone)]
pub struct SimCashDrawerHandle {
    shared: Arc<Shared>,
}

impl SimCashDrawerHandle {
    /// Push the drawer shut. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn is_open(&self) -> bool {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Number of successful open commands.
    pub fn open_count(&self) -> usize {
        self.shared.open_count.load(Ordering::SeqCst)
    }

    /// Make the next open command fail with `error`.
    pub fn fail_next(&self, error: DeviceError) {
        self.shared.core.fail_next(error);
    }
}

/// Blueprint plus control handle for a configured simulated drawer.
///
/// # Errors
///
/// Fails for malformed configuration values.
pub fn simulate(bag: &PropertyBag) -> Result<(DeviceBlueprint, SimCashDrawerHandle)> {
    let (driver, handle) = SimCashDrawer::from_properties(bag)?;
    Ok((DeviceBlueprint::new(schema()?, driver), handle))
}

/// Typed view of a cash drawer service.
#[derive(Debug)]
pub struct CashDrawer {
    service: Service,
}

impl CashDrawer {
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

    pub fn cap_status(&self) -> Result<bool> {
        self.service.get_bool("CapStatus")
    }

    pub fn drawer_opened(&self) -> Result<bool> {
        self.service.get_bool("DrawerOpened")
    }

    pub async fn open_drawer(&self) -> Result<()> {
        self.service.invoke("openDrawer", Params::new()).await?;
        Ok(())
    }

    /// Block until the drawer is closed.
    ///
    /// After `beep_timeout` milliseconds a beep of `beep_frequency` Hz and
    /// `beep_duration` milliseconds sounds every `beep_delay` milliseconds
    /// until the drawer closes. A `beep_timeout` of
    /// [`FOREVER`](upos_core::constants::FOREVER) never beeps. Returns at
    /// once if the drawer cannot report its state.
    ///
    /// # Errors
    ///
    /// Fails for negative timings other than `FOREVER`, for frequencies
    /// outside 10..=24000 Hz and when the device is not enabled.
    pub async fn wait_for_drawer_close(
        &self,
        beep_timeout: i64,
        beep_frequency: i64,
        beep_duration: i64,
        beep_delay: i64,
    ) -> Result<()> {
        for (name, value) in [
            ("beep timeout", beep_timeout),
            ("beep duration", beep_duration),
            ("beep delay", beep_delay),
        ] {
            if value < 0 && value != FOREVER {
                return Err(DeviceError::illegal_argument(format!("Negative {name}")));
            }
        }
        if !(10..=24_000).contains(&beep_frequency) {
            return Err(DeviceError::illegal_argument(format!(
                "Beep frequency out of range: {beep_frequency}"
            )));
        }
        if !self.cap_status()? {
            return Ok(());
        }

        let beeper = beep(
            self.service.logical_name(),
            beep_timeout,
            beep_frequency,
            beep_duration,
            beep_delay,
        );
        tokio::select! {
            result = self.service.wait_for("DrawerOpened", false, FOREVER) => result?,
            () = beeper => {}
        }
        info!("{}: drawer closed", self.service.logical_name());
        Ok(())
    }
}

/// Beep until dropped.
async fn beep(name: &str, timeout: i64, frequency: i64, duration: i64, delay: i64) {
    let millis = |value: i64| Duration::from_millis(u64::try_from(value).unwrap_or(0));
    if timeout == FOREVER {
        return std::future::pending().await;
    }
    tokio::time::sleep(millis(timeout.max(10))).await;
    loop {
        debug!("{}: beep {} Hz for {} ms", name, frequency, duration);
        tokio::time::sleep(millis(duration) + millis(delay).max(Duration::from_millis(10))).await;
    }
}
