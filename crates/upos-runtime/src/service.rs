//! Application side of one open device handle.
//!
//! Every call runs the state guards first (opened, claimed, enabled), then
//! the schema validators, and only then touches the driver or the request
//! queue. A call that fails validation leaves nothing behind.
//!
//! Calls that reach a driver hook or the request queue hold the device
//! control lock from the guard check to the last property update, so a
//! concurrent disable or release cannot slip in between.

use std::sync::Arc;

use tracing::{debug, info, warn};
use upos_core::{
    ControlState, DeviceError, ExclusiveUse, HealthLevel, PowerNotify, PowerReporting,
    PowerState, PropertyValue, Result, WaitTimeout,
    constants::{SUE_POWER_OFF, SUE_POWER_OFF_OFFLINE, SUE_POWER_OFFLINE, SUE_POWER_ONLINE},
};

use crate::claim::{self, check_claimed, check_enabled, check_opened};
use crate::device::{DeviceBlueprint, DeviceInner, DeviceRegistry};
use crate::dispatcher::Dispatcher;
use crate::listener::EventListener;
use crate::properties::{Capabilities, PropertySet, PropertyState, SessionId};
use crate::request::{Params, RequestHandle, RequestKind};
use crate::schema::{Access, Dispatch};

fn power_status(power: PowerState) -> Option<i32> {
    match power {
        PowerState::Online => Some(SUE_POWER_ONLINE),
        PowerState::Off => Some(SUE_POWER_OFF),
        PowerState::Offline => Some(SUE_POWER_OFFLINE),
        PowerState::OffOffline => Some(SUE_POWER_OFF_OFFLINE),
        PowerState::Unknown => None,
    }
}

/// One open handle on a physical device.
///
/// Share it between tasks through an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct Service {
    registry: DeviceRegistry,
    device: Arc<DeviceInner>,
    props: Arc<PropertySet>,
}

impl Service {
    pub(crate) fn new(
        registry: DeviceRegistry,
        device: Arc<DeviceInner>,
        props: Arc<PropertySet>,
    ) -> Self {
        Self {
            registry,
            device,
            props,
        }
    }

    /// Open `physical_id` under `logical_name`.
    ///
    /// # Errors
    ///
    /// Fails if the device cannot be created or the driver refuses the
    /// handle.
    pub fn open<F>(
        registry: &DeviceRegistry,
        logical_name: &str,
        physical_id: &str,
        factory: F,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<DeviceBlueprint>,
    {
        debug!("{}: open({})", logical_name, physical_id);
        let service = registry.open(logical_name, physical_id, factory, listener)?;
        info!("{}: open({}) done", logical_name, physical_id);
        Ok(service)
    }

    pub fn logical_name(&self) -> &str {
        self.props.logical_name()
    }

    pub fn physical_id(&self) -> &str {
        self.device.physical_id()
    }

    pub fn category(&self) -> &'static str {
        self.device.schema().name()
    }

    pub fn session(&self) -> SessionId {
        self.props.session()
    }

    pub fn property_set(&self) -> &Arc<PropertySet> {
        &self.props
    }

    fn claimer(&self) -> Option<SessionId> {
        self.device.claims().claimer()
    }

    /// Read the state of an open handle.
    fn read<R>(&self, f: impl FnOnce(&PropertyState) -> R) -> Result<R> {
        let state = self.props.lock();
        check_opened(&state)?;
        Ok(f(&state))
    }

    /// Mutate the state of an open handle.
    fn write<R>(&self, f: impl FnOnce(&mut PropertyState) -> Result<R>) -> Result<R> {
        let result = {
            let mut state = self.props.lock();
            check_opened(&state)?;
            f(&mut state)
        };
        self.props.flush_notifications();
        self.props.signal_waiters();
        result
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Take exclusive access.
    ///
    /// `timeout_ms` is 0 for no wait, [`FOREVER`](upos_core::constants::FOREVER)
    /// for an unbounded wait, or a positive number of milliseconds.
    ///
    /// # Errors
    ///
    /// Fails with `E_CLAIMED` if the claim is held elsewhere and the timeout
    /// is zero, with `Timeout` if a positive timeout expires, and with
    /// `IllegalArgument` for other negative timeouts.
    pub async fn claim(&self, timeout_ms: i64) -> Result<()> {
        debug!("{}: claim({})", self.logical_name(), timeout_ms);
        let (exclusive, claimed) = self.read(|s| (s.exclusive_use(), s.claimed()))?;
        if claimed {
            return Err(DeviceError::claimed("Device just claimed"));
        }
        if exclusive == ExclusiveUse::No {
            return Err(DeviceError::illegal_state("Device always shareable"));
        }
        let timeout = WaitTimeout::from_millis(timeout_ms)?;

        let session = self.session();
        self.device.claims().claim(session, timeout).await?;
        let _control = self.device.control();
        let claimed = self
            .props
            .snapshot(check_opened)
            .and_then(|()| self.device.driver().claim(session));
        if let Err(e) = claimed {
            self.device.claims().release(session);
            return Err(e);
        }
        self.props.update(|s| s.set_claimed(true));
        info!("{}: claim done", self.logical_name());
        Ok(())
    }

    /// Give up exclusive access. Exclusive devices are disabled first.
    ///
    /// # Errors
    ///
    /// Fails with `E_NOTCLAIMED` if this handle does not hold the claim.
    pub fn release(&self) -> Result<()> {
        debug!("{}: release()", self.logical_name());
        let _control = self.device.control();
        let (claimed, enabled, exclusive) =
            self.read(|s| (s.claimed(), s.device_enabled(), s.exclusive_use()))?;
        if !claimed {
            return Err(DeviceError::not_claimed("Device not claimed"));
        }
        if enabled && exclusive == ExclusiveUse::Yes {
            self.disable_device()?;
        }
        self.release_claim()?;
        info!("{}: release done", self.logical_name());
        Ok(())
    }

    fn release_claim(&self) -> Result<()> {
        let session = self.session();
        let result = self.device.driver().release(session);
        self.device.claims().release(session);
        self.props.update(|s| s.set_claimed(false));
        result
    }

    /// Enable or disable the device.
    ///
    /// # Errors
    ///
    /// Exclusive devices must be claimed. Enabling an enabled device or
    /// disabling a disabled one is an error.
    pub fn set_device_enabled(&self, enable: bool) -> Result<()> {
        debug!("{}: set_device_enabled({})", self.logical_name(), enable);
        let _control = self.device.control();
        let claimer = self.claimer();
        let enabled = {
            let state = self.props.lock();
            check_claimed(&state, claimer)?;
            state.device_enabled()
        };
        match (enable, enabled) {
            (true, true) => return Err(DeviceError::illegal_state("Device just enabled")),
            (false, false) => return Err(DeviceError::disabled("Device just disabled")),
            (true, false) => self.enable_device()?,
            (false, true) => self.disable_device()?,
        }
        info!(
            "{}: set_device_enabled({}) done",
            self.logical_name(),
            enable
        );
        Ok(())
    }

    fn enable_device(&self) -> Result<()> {
        let driver = self.device.driver();
        driver.enable(&self.props, true)?;
        let notify = self.props.update(|s| {
            s.set_device_enabled(true);
            s.power_notify() == PowerNotify::Enabled
        });
        if notify && let Some(status) = power_status(driver.power_state()) {
            self.props.post_status(status);
        }
        self.props.kick_events();
        Ok(())
    }

    fn disable_device(&self) -> Result<()> {
        self.device.driver().enable(&self.props, false)?;
        self.props.update(|s| {
            s.set_device_enabled(false);
            if s.power_notify() == PowerNotify::Enabled {
                s.set_power_state(PowerState::Unknown);
            }
        });
        Ok(())
    }

    /// Close the handle: abort its requests, disable, release, and detach
    /// from the device.
    ///
    /// # Errors
    ///
    /// Fails with `E_CLOSED` if the handle is already closed.
    pub async fn close(&self) -> Result<()> {
        debug!("{}: close()", self.logical_name());
        self.read(|_| ())?;

        self.device.dispatcher().clear(&self.props, None).await;
        {
            let _control = self.device.control();
            let (enabled, claimed) = self.read(|s| (s.device_enabled(), s.claimed()))?;
            if enabled && let Err(e) = self.disable_device() {
                warn!("{}: disable on close: {}", self.logical_name(), e);
            }
            if claimed && let Err(e) = self.release_claim() {
                warn!("{}: release on close: {}", self.logical_name(), e);
            }
            self.props.cancel_delayed();
            self.device.driver().close(self.session());

            self.props.update(|s| {
                s.events.clear();
                s.held.clear();
                s.set_state(ControlState::Closed);
            });
        }
        self.registry.close_session(&self.device, self.session());
        info!("{}: close done", self.logical_name());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Common properties
    // ------------------------------------------------------------------

    /// Control state. Readable on closed handles.
    pub fn state(&self) -> ControlState {
        self.props.snapshot(PropertyState::state)
    }

    pub fn claimed(&self) -> Result<bool> {
        self.read(PropertyState::claimed)
    }

    pub fn device_enabled(&self) -> Result<bool> {
        self.read(PropertyState::device_enabled)
    }

    pub fn freeze_events(&self) -> Result<bool> {
        self.read(PropertyState::freeze_events)
    }

    pub fn data_event_enabled(&self) -> Result<bool> {
        self.read(PropertyState::data_event_enabled)
    }

    pub fn auto_disable(&self) -> Result<bool> {
        self.read(PropertyState::auto_disable)
    }

    pub fn async_mode(&self) -> Result<bool> {
        self.read(PropertyState::async_mode)
    }

    pub fn data_count(&self) -> Result<i32> {
        self.read(PropertyState::data_count)
    }

    /// `OutputID` of the most recently queued output request.
    pub fn output_id(&self) -> Result<i32> {
        self.read(PropertyState::output_id)
    }

    pub fn power_notify(&self) -> Result<PowerNotify> {
        self.read(PropertyState::power_notify)
    }

    pub fn power_state(&self) -> Result<PowerState> {
        self.read(PropertyState::power_state)
    }

    pub fn flag_when_idle(&self) -> Result<bool> {
        self.read(PropertyState::flag_when_idle)
    }

    pub fn check_health_text(&self) -> Result<String> {
        self.read(|s| s.check_health_text().to_string())
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        self.read(|s| s.capabilities().clone())
    }

    pub fn exclusive_use(&self) -> Result<ExclusiveUse> {
        self.read(PropertyState::exclusive_use)
    }

    /// Requests of this handle that have not finished yet.
    pub fn command_count(&self) -> Result<usize> {
        self.read(|_| ())?;
        Ok(self.device.dispatcher().count_commands(self.session()))
    }

    pub fn set_freeze_events(&self, freeze: bool) -> Result<()> {
        self.write(|s| {
            s.set_freeze_events(freeze);
            Ok(())
        })?;
        self.props.kick_events();
        Ok(())
    }

    pub fn set_data_event_enabled(&self, enabled: bool) -> Result<()> {
        self.write(|s| {
            s.set_data_event_enabled(enabled);
            Ok(())
        })?;
        self.props.kick_events();
        Ok(())
    }

    pub fn set_async_mode(&self, async_mode: bool) -> Result<()> {
        self.write(|s| {
            s.set_async_mode(async_mode);
            Ok(())
        })
    }

    pub fn set_auto_disable(&self, auto_disable: bool) -> Result<()> {
        self.write(|s| {
            s.set_auto_disable(auto_disable);
            Ok(())
        })
    }

    /// Change power notification. Only legal while the device is disabled.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalState` while enabled and with `NotSupported` when
    /// enabling on a device without power reporting.
    pub fn set_power_notify(&self, notify: PowerNotify) -> Result<()> {
        self.write(|s| {
            if s.device_enabled() {
                return Err(DeviceError::illegal_state("Device enabled"));
            }
            if notify == PowerNotify::Enabled
                && s.capabilities().power_reporting == PowerReporting::None
            {
                return Err(DeviceError::unsupported("PowerNotify"));
            }
            s.set_power_notify(notify);
            Ok(())
        })
    }

    /// Ask for the idle status event once the handle becomes idle. Fires at
    /// once if it already is.
    pub fn set_flag_when_idle(&self, flag: bool) -> Result<()> {
        let idle_status = self.write(|s| {
            if flag && s.state() == ControlState::Idle {
                s.set_flag_when_idle(false);
                Ok(self.props.schema().idle_status())
            } else {
                s.set_flag_when_idle(flag);
                Ok(None)
            }
        })?;
        if let Some(status) = idle_status {
            self.props.deliver_status(status);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Category properties and operations
    // ------------------------------------------------------------------

    /// Value of category property `name`.
    ///
    /// # Errors
    ///
    /// Fails for unknown properties and when the property's read
    /// precondition does not hold.
    pub fn get(&self, name: &str) -> Result<PropertyValue> {
        let spec = self
            .props
            .schema()
            .property(name)
            .ok_or_else(|| DeviceError::illegal_argument(format!("Unknown property {name}")))?;
        let claimer = self.claimer();
        let state = self.props.lock();
        claim::check(spec.read_requires(), &state, claimer)?;
        state
            .value(name)
            .cloned()
            .ok_or_else(|| DeviceError::illegal_argument(format!("Unknown property {name}")))
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        let value = self.get(name)?;
        value
            .as_int()
            .ok_or_else(|| DeviceError::illegal_argument(format!("{name} is {}", value.kind())))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        let value = self.get(name)?;
        value
            .as_bool()
            .ok_or_else(|| DeviceError::illegal_argument(format!("{name} is {}", value.kind())))
    }

    /// Set writable category property `name`.
    ///
    /// # Errors
    ///
    /// Fails for read-only properties, when the write precondition does not
    /// hold, when the capability gate is off, and for values the validator
    /// rejects.
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        debug!("{}: set {} = {}", self.logical_name(), name, value);
        let spec = self
            .props
            .schema()
            .property(name)
            .ok_or_else(|| DeviceError::illegal_argument(format!("Unknown property {name}")))?;
        let Access::ReadWrite(precondition) = spec.access() else {
            return Err(DeviceError::illegal_argument(format!("{name} is read-only")));
        };
        let _control = self.device.control();
        let claimer = self.claimer();
        {
            let state = self.props.lock();
            claim::check(precondition, &state, claimer)?;
            if let Some(capability) = spec.capability()
                && state.bool(capability) != Some(true)
            {
                return Err(DeviceError::unsupported(format!("{name} ({capability} false)")));
            }
            spec.check(&value, &state)?;
        }
        self.device
            .driver()
            .set_property(&self.props, name, &value)?;
        self.props.update(|s| s.set_value(name, value))?;
        info!("{}: set {} done", self.logical_name(), name);
        Ok(())
    }

    /// Call category operation `operation`.
    ///
    /// Synchronous calls return `Ok(None)` once the driver finished.
    /// Asynchronous calls return a handle as soon as the request is queued;
    /// the result arrives as an `OutputComplete` or error event. Operations
    /// that support both run asynchronously while `AsyncMode` is set.
    ///
    /// # Errors
    ///
    /// Fails for unknown operations, failed guards, missing capabilities and
    /// rejected parameters, before anything is queued. Synchronous calls
    /// also return the driver's error.
    pub async fn invoke(&self, operation: &str, params: Params) -> Result<Option<RequestHandle>> {
        debug!("{}: {}({:?})", self.logical_name(), operation, params);
        let spec = self
            .props
            .schema()
            .operation(operation)
            .ok_or_else(|| {
                DeviceError::illegal_argument(format!("Unknown operation {operation}"))
            })?;
        let request = {
            let _control = self.device.control();
            let claimer = self.claimer();
            let synchronous = {
                let state = self.props.lock();
                claim::check(spec.precondition(), &state, claimer)?;
                if let Some(capability) = spec.capability()
                    && state.bool(capability) != Some(true)
                {
                    return Err(DeviceError::unsupported(format!(
                        "{operation} ({capability} false)"
                    )));
                }
                spec.validate(&params, &state)?;
                match spec.dispatch_mode() {
                    Dispatch::Synchronous => true,
                    Dispatch::Asynchronous => false,
                    Dispatch::AsyncCapable => !state.async_mode(),
                }
            };
            let dispatcher = self.device.dispatcher();
            let request = dispatcher.request(&self.props, spec, params, synchronous);
            dispatcher.enqueue(request.clone());
            request
        };

        if request.is_synchronous() {
            Dispatcher::finish_synchronous(&request).await?;
            info!("{}: {} done", self.logical_name(), operation);
            Ok(None)
        } else {
            Ok(Some(RequestHandle::new(request)))
        }
    }

    /// Block until category property `name` holds `value`.
    ///
    /// # Errors
    ///
    /// Fails with `Timeout` if the value is not reached in time and with
    /// `E_CLOSED` if the handle is closed meanwhile.
    pub async fn wait_for(
        &self,
        name: &str,
        value: impl Into<PropertyValue>,
        timeout_ms: i64,
    ) -> Result<()> {
        let value = value.into();
        let timeout = WaitTimeout::from_millis(timeout_ms)?;
        let claimer = self.claimer();
        {
            let state = self.props.lock();
            check_enabled(&state, claimer)?;
            match state.value(name) {
                Some(current) if current.kind() == value.kind() => {}
                Some(current) => {
                    return Err(DeviceError::illegal_argument(format!(
                        "{name} is {}",
                        current.kind()
                    )));
                }
                None => {
                    return Err(DeviceError::illegal_argument(format!(
                        "Unknown property {name}"
                    )));
                }
            }
        }

        debug!("{}: wait for {} = {}", self.logical_name(), name, value);
        let reached = self
            .props
            .wait_until(timeout, |s| {
                s.state() == ControlState::Closed || s.value(name) == Some(&value)
            })
            .await;
        let state = self.props.lock();
        check_opened(&state)?;
        if reached && state.value(name) == Some(&value) {
            Ok(())
        } else {
            Err(DeviceError::timeout(
                timeout.as_millis(),
                format!("{name} did not become {value}"),
            ))
        }
    }

    /// Run a health check; the result is also stored in `CheckHealthText`.
    pub fn check_health(&self, level: HealthLevel) -> Result<String> {
        debug!("{}: check_health({:?})", self.logical_name(), level);
        let _control = self.device.control();
        let claimer = self.claimer();
        self.props.snapshot(|s| check_enabled(s, claimer))?;
        match self.device.driver().check_health(&self.props, level) {
            Ok(text) => {
                self.props.update(|s| s.set_check_health_text(text.clone()));
                info!("{}: check_health: {}", self.logical_name(), text);
                Ok(text)
            }
            Err(e) => {
                let text = format!("{level:?} check: {}", e.message());
                self.props.update(|s| s.set_check_health_text(text));
                Err(e)
            }
        }
    }

    /// Abort input requests and drop buffered input.
    pub async fn clear_input(&self) -> Result<()> {
        debug!("{}: clear_input()", self.logical_name());
        let claimer = self.claimer();
        self.props.snapshot(|s| check_claimed(s, claimer))?;
        self.device
            .dispatcher()
            .clear(&self.props, Some(RequestKind::Input))
            .await;
        self.props.discard_input_events();
        Ok(())
    }

    /// Abort output requests.
    pub async fn clear_output(&self) -> Result<()> {
        debug!("{}: clear_output()", self.logical_name());
        let claimer = self.claimer();
        self.props.snapshot(|s| check_claimed(s, claimer))?;
        self.device
            .dispatcher()
            .clear(&self.props, Some(RequestKind::Output))
            .await;
        Ok(())
    }

    /// Reset the properties filled by data events.
    pub fn clear_input_properties(&self) -> Result<()> {
        let _control = self.device.control();
        let claimer = self.claimer();
        let schema = self.props.schema_arc();
        self.props.snapshot(|s| check_enabled(s, claimer))?;
        self.props.update(|s| s.reset_input_values(&schema));
        Ok(())
    }

    /// Vendor specific command. Returns the driver's data and payload.
    pub fn direct_io(&self, command: i32, data: i64, payload: &str) -> Result<(i64, String)> {
        debug!("{}: direct_io({}, {})", self.logical_name(), command, data);
        let _control = self.device.control();
        let claimer = self.claimer();
        self.props.snapshot(|s| check_claimed(s, claimer))?;
        self.device
            .driver()
            .direct_io(&self.props, command, data, payload)
    }
}
