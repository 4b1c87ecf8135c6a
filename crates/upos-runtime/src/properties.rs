//! Per-handle property state.
//!
//! Every open service handle owns one [`PropertySet`]. The mutable part lives
//! in a [`PropertyState`] behind the set's mutex; every mutation goes through
//! a setter that records an owed change notification, and the notifications
//! are flushed to the listener once the lock has been released.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;
use upos_core::{
    ControlState, DeviceError, ExclusiveUse, PowerNotify, PowerReporting, PowerState,
    PropertyValue, Result, WaitTimeout, constants::DEFAULT_SERVICE_VERSION,
};

use crate::config::RuntimeOptions;
use crate::delayed::BufferedStatus;
use crate::device::DeviceInner;
use crate::event::Event;
use crate::listener::EventListener;
use crate::schema::CategorySchema;

/// Identifies one open service handle.
pub type SessionId = u64;

/// A property value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub name: String,
    pub value: PropertyValue,
}

/// Capability flags of a service.
///
/// One flat set instead of one type per service version: fields introduced
/// by later versions simply default to "not supported".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// `major * 1_000_000 + minor * 1000 + build`.
    pub service_version: u32,
    pub power_reporting: PowerReporting,
    pub statistics_reporting: bool,
    pub update_statistics: bool,
    pub compare_firmware_version: bool,
    pub update_firmware: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            service_version: DEFAULT_SERVICE_VERSION,
            power_reporting: PowerReporting::None,
            statistics_reporting: false,
            update_statistics: false,
            compare_firmware_version: false,
            update_firmware: false,
        }
    }
}

/// Mutable state of one open handle.
#[derive(Debug)]
pub struct PropertyState {
    session: SessionId,
    logical_name: String,
    exclusive_use: ExclusiveUse,
    capabilities: Capabilities,
    state: ControlState,
    claimed: bool,
    device_enabled: bool,
    first_enable_happened: bool,
    freeze_events: bool,
    data_event_enabled: bool,
    auto_disable: bool,
    async_mode: bool,
    data_count: i32,
    output_id: i32,
    power_notify: PowerNotify,
    power_state: PowerState,
    flag_when_idle: bool,
    check_health_text: String,
    values: BTreeMap<String, PropertyValue>,
    owed: Vec<PropertyChange>,
    /// Events waiting to be fired, in generation order.
    pub(crate) events: VecDeque<Event>,
    /// Data and input error events passed over while `DataEventEnabled` was
    /// false.
    pub(crate) held: VecDeque<Event>,
    /// A firing task is draining `events`.
    pub(crate) firing: bool,
}

impl PropertyState {
    pub(crate) fn new(session: SessionId, logical_name: &str, schema: &CategorySchema) -> Self {
        let values = schema
            .properties()
            .iter()
            .map(|p| (p.name().to_string(), p.default_value().clone()))
            .collect();

        Self {
            session,
            logical_name: logical_name.to_string(),
            exclusive_use: schema.exclusive_use(),
            capabilities: schema.capabilities().clone(),
            state: ControlState::Idle,
            claimed: false,
            device_enabled: false,
            first_enable_happened: false,
            freeze_events: false,
            data_event_enabled: false,
            auto_disable: false,
            async_mode: false,
            data_count: 0,
            output_id: 0,
            power_notify: PowerNotify::Disabled,
            power_state: PowerState::Unknown,
            flag_when_idle: false,
            check_health_text: String::new(),
            values,
            owed: Vec::new(),
            events: VecDeque::new(),
            held: VecDeque::new(),
            firing: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(logical_name: &str) -> Self {
        Self::new(
            0,
            logical_name,
            &CategorySchema::builder("Test").build().unwrap(),
        )
    }

    fn note(&mut self, name: &str, value: impl Into<PropertyValue>) {
        self.owed.push(PropertyChange {
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub(crate) fn take_notifications(&mut self) -> Vec<PropertyChange> {
        std::mem::take(&mut self.owed)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn exclusive_use(&self) -> ExclusiveUse {
        self.exclusive_use
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Replace the capability set. Only legal while the driver's open hook
    /// initializes the handle.
    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn claimed(&self) -> bool {
        self.claimed
    }

    pub fn device_enabled(&self) -> bool {
        self.device_enabled
    }

    pub fn first_enable_happened(&self) -> bool {
        self.first_enable_happened
    }

    pub fn freeze_events(&self) -> bool {
        self.freeze_events
    }

    pub fn data_event_enabled(&self) -> bool {
        self.data_event_enabled
    }

    pub fn auto_disable(&self) -> bool {
        self.auto_disable
    }

    pub fn async_mode(&self) -> bool {
        self.async_mode
    }

    pub fn data_count(&self) -> i32 {
        self.data_count
    }

    pub fn output_id(&self) -> i32 {
        self.output_id
    }

    pub fn power_notify(&self) -> PowerNotify {
        self.power_notify
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    pub fn flag_when_idle(&self) -> bool {
        self.flag_when_idle
    }

    pub fn check_health_text(&self) -> &str {
        &self.check_health_text
    }

    pub(crate) fn set_state(&mut self, state: ControlState) {
        if self.state != state {
            self.state = state;
            self.note("State", state as i32);
        }
    }

    pub(crate) fn set_claimed(&mut self, claimed: bool) {
        if self.claimed != claimed {
            self.claimed = claimed;
            self.note("Claimed", claimed);
        }
    }

    pub(crate) fn set_device_enabled(&mut self, enabled: bool) {
        if self.device_enabled != enabled {
            self.device_enabled = enabled;
            self.note("DeviceEnabled", enabled);
        }
        if enabled {
            self.first_enable_happened = true;
        }
    }

    pub(crate) fn set_freeze_events(&mut self, freeze: bool) {
        if self.freeze_events != freeze {
            self.freeze_events = freeze;
            self.note("FreezeEvents", freeze);
        }
    }

    pub(crate) fn set_data_event_enabled(&mut self, enabled: bool) {
        if self.data_event_enabled != enabled {
            self.data_event_enabled = enabled;
            self.note("DataEventEnabled", enabled);
        }
    }

    pub(crate) fn set_auto_disable(&mut self, auto_disable: bool) {
        if self.auto_disable != auto_disable {
            self.auto_disable = auto_disable;
            self.note("AutoDisable", auto_disable);
        }
    }

    pub(crate) fn set_async_mode(&mut self, async_mode: bool) {
        if self.async_mode != async_mode {
            self.async_mode = async_mode;
            self.note("AsyncMode", async_mode);
        }
    }

    pub(crate) fn set_data_count(&mut self, count: i32) {
        if self.data_count != count {
            self.data_count = count;
            self.note("DataCount", count);
        }
    }

    /// Advance `OutputID` and return the new value. Wraps to 1 after
    /// `i32::MAX`.
    pub(crate) fn next_output_id(&mut self) -> i32 {
        self.output_id = self.output_id.checked_add(1).unwrap_or(1);
        self.note("OutputID", self.output_id);
        self.output_id
    }

    pub(crate) fn set_power_notify(&mut self, notify: PowerNotify) {
        if self.power_notify != notify {
            self.power_notify = notify;
            self.note("PowerNotify", notify == PowerNotify::Enabled);
        }
    }

    pub(crate) fn set_power_state(&mut self, power: PowerState) {
        if self.power_state != power {
            self.power_state = power;
            self.note("PowerState", power as i32);
        }
    }

    pub(crate) fn set_flag_when_idle(&mut self, flag: bool) {
        if self.flag_when_idle != flag {
            self.flag_when_idle = flag;
            self.note("FlagWhenIdle", flag);
        }
    }

    pub(crate) fn set_check_health_text(&mut self, text: String) {
        if self.check_health_text != text {
            self.note("CheckHealthText", text.as_str());
            self.check_health_text = text;
        }
    }

    /// Current value of category property `name`.
    pub fn value(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.value(name).and_then(PropertyValue::as_int)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.value(name).and_then(PropertyValue::as_bool)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(PropertyValue::as_text)
    }

    /// Set category property `name`, returning whether the value changed.
    ///
    /// # Errors
    ///
    /// Returns `IllegalArgument` if the category has no such property or the
    /// value has the wrong type.
    pub fn set_value(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<bool> {
        let value = value.into();
        let current = self.values.get_mut(name).ok_or_else(|| {
            DeviceError::illegal_argument(format!("Unknown property {name}"))
        })?;
        if current.kind() != value.kind() {
            return Err(DeviceError::illegal_argument(format!(
                "{name}: expected {}, got {}",
                current.kind(),
                value.kind()
            )));
        }
        if *current == value {
            return Ok(false);
        }
        *current = value.clone();
        self.owed.push(PropertyChange {
            name: name.to_string(),
            value,
        });
        Ok(true)
    }

    /// Restore the properties filled by data events to their defaults.
    pub(crate) fn reset_input_values(&mut self, schema: &CategorySchema) {
        for spec in schema.properties().iter().filter(|p| p.is_input_data()) {
            // Names and kinds come from the same schema.
            let _ = self.set_value(spec.name(), spec.default_value().clone());
        }
    }
}

/// One open handle's property state plus its event plumbing.
pub struct PropertySet {
    session: SessionId,
    logical_name: String,
    schema: Arc<CategorySchema>,
    state: Mutex<PropertyState>,
    changed: Notify,
    pub(crate) delayed: Mutex<Option<BufferedStatus>>,
    pub(crate) listener: Arc<dyn EventListener>,
    pub(crate) options: RuntimeOptions,
    pub(crate) runtime: Handle,
    pub(crate) device: Weak<DeviceInner>,
}

impl PropertySet {
    pub(crate) fn new(
        session: SessionId,
        logical_name: &str,
        schema: Arc<CategorySchema>,
        listener: Arc<dyn EventListener>,
        options: RuntimeOptions,
        runtime: Handle,
        device: Weak<DeviceInner>,
    ) -> Self {
        let state = PropertyState::new(session, logical_name, &schema);
        Self {
            session,
            logical_name: logical_name.to_string(),
            schema,
            state: Mutex::new(state),
            changed: Notify::new(),
            delayed: Mutex::new(None),
            listener,
            options,
            runtime,
            device,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn schema(&self) -> &CategorySchema {
        &self.schema
    }

    pub(crate) fn schema_arc(&self) -> Arc<CategorySchema> {
        self.schema.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PropertyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the state under the lock.
    pub fn snapshot<R>(&self, f: impl FnOnce(&PropertyState) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the state under the lock, then emit the owed notifications and
    /// wake status waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut PropertyState) -> R) -> R {
        let result = f(&mut self.lock());
        self.flush_notifications();
        self.signal_waiters();
        result
    }

    /// Emit owed change notifications. Never called with the lock held.
    ///
    /// Held back while the device control lock is taken, so that a listener
    /// calling into the service does not deadlock; the control guard flushes
    /// on release.
    pub(crate) fn flush_notifications(&self) {
        if self
            .device
            .upgrade()
            .is_some_and(|device| device.defers_notifications())
        {
            return;
        }
        let changes = self.lock().take_notifications();
        for change in changes {
            info!("{}: {} <- {}", self.logical_name, change.name, change.value);
            self.listener.on_property_changed(&self.logical_name, &change);
        }
    }

    /// Wake every task blocked in [`wait_until`](Self::wait_until).
    pub(crate) fn signal_waiters(&self) {
        self.changed.notify_waiters();
    }

    /// Block until `condition` holds or `timeout` elapses.
    ///
    /// The condition is re-evaluated after every event delivery and every
    /// property update, whether or not a value changed. Returns the final
    /// evaluation.
    pub async fn wait_until<F>(&self, timeout: WaitTimeout, condition: F) -> bool
    where
        F: Fn(&PropertyState) -> bool,
    {
        let deadline = match timeout {
            WaitTimeout::After(duration) => Some(Instant::now() + duration),
            WaitTimeout::Forever => None,
        };
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if condition(&self.lock()) {
                return true;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return condition(&self.lock());
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PropertySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertySet")
            .field("session", &self.session)
            .field("logical_name", &self.logical_name)
            .field("category", &self.schema.name())
            .finish_non_exhaustive()
    }
}
