//! Event delivery.
//!
//! Every event is first buffered in the target property set's queue and
//! then fired by that set's firing task, one at a time and in generation
//! order. `FreezeEvents` holds the whole queue. Data events and input errors
//! additionally wait while `DataEventEnabled` is false; other events may
//! overtake them unless the runtime runs in strict FIFO mode.
//!
//! Status updates follow a two-phase contract: [`StatusUpdate::apply`]
//! mutates the property set, [`StatusUpdate::corresponds`] independently
//! re-checks that the property set now reflects the status, and
//! [`StatusUpdate::set_and_check`] composes both and reports whether
//! anything actually changed.

use std::sync::Arc;

use tracing::{debug, error, warn};
use upos_core::{
    ControlState, DeviceError, ErrorCode, ErrorLocus, ErrorResponse, PowerNotify, PowerState,
    PropertyValue,
    constants::{
        SUE_POWER_OFF, SUE_POWER_OFF_OFFLINE, SUE_POWER_OFFLINE, SUE_POWER_ONLINE,
        SUE_UF_COMPLETE, SUE_UF_PROGRESS, is_firmware_status, is_power_status,
    },
};

use crate::properties::{PropertySet, PropertyState};
use crate::request::RequestKind;
use crate::schema::CategorySchema;

/// A status change reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusUpdate {
    pub status: i32,
}

impl StatusUpdate {
    pub fn new(status: i32) -> Self {
        Self { status }
    }

    /// Power statuses are suppressed while power notification is disabled.
    pub fn blocked(&self, state: &PropertyState) -> bool {
        state.power_notify() == PowerNotify::Disabled && is_power_status(self.status)
    }

    fn power_state(&self) -> Option<PowerState> {
        match self.status {
            SUE_POWER_ONLINE => Some(PowerState::Online),
            SUE_POWER_OFF => Some(PowerState::Off),
            SUE_POWER_OFFLINE => Some(PowerState::Offline),
            SUE_POWER_OFF_OFFLINE => Some(PowerState::OffOffline),
            _ => None,
        }
    }

    /// Apply the status, returning `None` for statuses neither the runtime
    /// nor the category knows and `Some(changed)` otherwise.
    fn apply_tracked(&self, state: &mut PropertyState, schema: &CategorySchema) -> Option<bool> {
        if let Some(power) = self.power_state() {
            let changed = state.power_state() != power;
            state.set_power_state(power);
            return Some(changed);
        }
        if is_firmware_status(self.status) {
            return Some(true);
        }
        let rule = schema.status_rule(self.status)?;
        let mut changed = false;
        for (name, value) in rule.effects() {
            match state.set_value(name, value.clone()) {
                Ok(c) => changed |= c,
                Err(e) => warn!("{}: status {}: {}", state.logical_name(), self.status, e),
            }
        }
        Some(changed)
    }

    /// Mutate the property set as the status demands. Returns `false` for
    /// unknown statuses.
    pub fn apply(&self, state: &mut PropertyState, schema: &CategorySchema) -> bool {
        self.apply_tracked(state, schema).is_some()
    }

    /// Check that the property set reflects the status.
    pub fn corresponds(&self, state: &PropertyState, schema: &CategorySchema) -> bool {
        if let Some(power) = self.power_state() {
            return state.power_state() == power;
        }
        if is_firmware_status(self.status) {
            return true;
        }
        match schema.status_rule(self.status) {
            Some(rule) => rule
                .effects()
                .iter()
                .all(|(name, value)| state.value(name) == Some(value)),
            None => false,
        }
    }

    /// Apply, verify, and report whether anything changed.
    ///
    /// Firmware update statuses always count as a change; applying the same
    /// power or category status twice reports no change the second time.
    pub fn set_and_check(&self, state: &mut PropertyState, schema: &CategorySchema) -> bool {
        match self.apply_tracked(state, schema) {
            Some(changed) => {
                if !self.corresponds(state, schema) {
                    error!(
                        "{}: property state does not reflect status {}",
                        state.logical_name(),
                        self.describe(schema)
                    );
                }
                changed
            }
            None => false,
        }
    }

    /// Human readable description.
    pub fn describe(&self, schema: &CategorySchema) -> String {
        match self.status {
            SUE_POWER_ONLINE => "Device Online".to_string(),
            SUE_POWER_OFF => "Device Off".to_string(),
            SUE_POWER_OFFLINE => "Device Offline".to_string(),
            SUE_POWER_OFF_OFFLINE => "Device Off or Offline".to_string(),
            s if s > SUE_UF_PROGRESS && s < SUE_UF_COMPLETE => {
                format!("Firmware Update ({}%)", s - SUE_UF_PROGRESS)
            }
            s if is_firmware_status(s) => format!("Firmware Update Result {s}"),
            s => match schema.status_rule(s) {
                Some(rule) => rule.label().to_string(),
                None if schema.idle_status() == Some(s) => "Device idle".to_string(),
                None => format!("Unknown {} Status Change: {s}", schema.name()),
            },
        }
    }
}

/// Input delivered by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    pub status: i32,
    /// Properties set when the event is fired.
    pub values: Vec<(String, PropertyValue)>,
}

impl DataEvent {
    pub fn new(status: i32) -> Self {
        Self {
            status,
            values: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.values.push((name.to_string(), value.into()));
        self
    }
}

/// A failure that happened outside the caller's thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub extended: i32,
    pub locus: ErrorLocus,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(code: ErrorCode, extended: i32, locus: ErrorLocus, message: impl Into<String>) -> Self {
        Self {
            code,
            extended,
            locus,
            message: message.into(),
        }
    }

    pub fn from_error(error: &DeviceError, locus: ErrorLocus) -> Self {
        Self::new(error.code(), error.extended_code(), locus, error.message())
    }

    /// Copy of an input error for the events still buffered before it.
    fn input_data(&self) -> Self {
        Self {
            locus: ErrorLocus::InputData,
            ..self.clone()
        }
    }
}

/// Vendor specific notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectIoEvent {
    pub command: i32,
    pub data: i64,
    pub payload: String,
}

/// Anything fired to an [`EventListener`](crate::EventListener).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    Status(StatusUpdate),
    Data(DataEvent),
    Error(ErrorEvent),
    OutputComplete { output_id: i32 },
    DirectIo(DirectIoEvent),
}

impl Event {
    /// Data events and input errors wait for `DataEventEnabled`.
    fn waits_for_data_enabled(&self) -> bool {
        match self {
            Self::Data(_) => true,
            Self::Error(error) => error.locus != ErrorLocus::Output,
            _ => false,
        }
    }
}

fn locus_kind(locus: ErrorLocus) -> RequestKind {
    match locus {
        ErrorLocus::Output => RequestKind::Output,
        ErrorLocus::Input | ErrorLocus::InputData => RequestKind::Input,
    }
}

/// Pick the next event to fire and run its pre-fire property updates.
fn next_event(state: &mut PropertyState, strict_fifo: bool) -> Option<Event> {
    loop {
        if state.freeze_events() {
            return None;
        }
        let event = match state.data_event_enabled() {
            true => match state.held.pop_front() {
                Some(event) => event,
                None => state.events.pop_front()?,
            },
            false => state.events.pop_front()?,
        };
        if event.waits_for_data_enabled() && !state.data_event_enabled() {
            if strict_fifo {
                state.events.push_front(event);
                return None;
            }
            state.held.push_back(event);
            continue;
        }
        if let Event::Data(data) = &event {
            state.set_data_count(state.data_count() - 1);
            state.set_data_event_enabled(false);
            for (name, value) in &data.values {
                if let Err(e) = state.set_value(name, value.clone()) {
                    warn!("{}: data event: {}", state.logical_name(), e);
                }
            }
        }
        return Some(event);
    }
}

fn has_deliverable(state: &PropertyState) -> bool {
    !state.freeze_events()
        && (!state.events.is_empty() || (state.data_event_enabled() && !state.held.is_empty()))
}

impl PropertySet {
    /// Apply `status` now and buffer it for firing.
    pub(crate) fn deliver_status(self: &Arc<Self>, status: i32) {
        let update = StatusUpdate::new(status);
        let queued = {
            let mut state = self.lock();
            if update.blocked(&state) {
                false
            } else {
                update.set_and_check(&mut state, self.schema());
                if state.device_enabled() {
                    debug!(
                        "{}: Buffer StatusUpdateEvent: [{}]",
                        self.logical_name(),
                        update.describe(self.schema())
                    );
                    state.events.push_back(Event::Status(update));
                    true
                } else {
                    false
                }
            }
        };
        self.flush_notifications();
        self.signal_waiters();
        if queued {
            self.kick_events();
        }
    }

    /// Buffer a data event. Dropped while the device is disabled.
    pub(crate) fn post_data(self: &Arc<Self>, event: DataEvent) {
        let disable = {
            let mut state = self.lock();
            if !state.device_enabled() {
                return;
            }
            debug!(
                "{}: Buffer DataEvent: [{}]",
                self.logical_name(),
                event.status
            );
            state.events.push_back(Event::Data(event));
            let count = state.data_count() + 1;
            state.set_data_count(count);
            if state.auto_disable() {
                state.set_device_enabled(false);
                true
            } else {
                false
            }
        };
        if disable
            && let Some(device) = self.device.upgrade()
            && let Err(e) = device.driver().enable(self, false)
        {
            warn!("{}: auto disable: {}", self.logical_name(), e);
        }
        self.flush_notifications();
        self.signal_waiters();
        self.kick_events();
    }

    /// Buffer an error event and enter the error state. Dropped while the
    /// device is disabled.
    pub(crate) fn post_error(self: &Arc<Self>, event: ErrorEvent) {
        {
            let mut state = self.lock();
            if !state.device_enabled() {
                return;
            }
            state.set_state(ControlState::Error);
            if event.locus == ErrorLocus::Input && state.data_count() > 0 {
                let marker = Event::Error(event.input_data());
                if state.held.iter().any(|e| matches!(e, Event::Data(_))) {
                    state.held.push_front(marker);
                } else if let Some(index) =
                    state.events.iter().position(|e| matches!(e, Event::Data(_)))
                {
                    state.events.insert(index, marker);
                }
            }
            debug!(
                "{}: Buffer ErrorEvent: [{}/{}/{:?}/{}]",
                self.logical_name(),
                event.code,
                event.extended,
                event.locus,
                event.message
            );
            state.events.push_back(Event::Error(event));
        }
        self.flush_notifications();
        self.signal_waiters();
        self.kick_events();
    }

    pub(crate) fn post_output_complete(self: &Arc<Self>, output_id: i32) {
        debug!(
            "{}: Buffer OutputCompleteEvent: [{}]",
            self.logical_name(),
            output_id
        );
        self.lock()
            .events
            .push_back(Event::OutputComplete { output_id });
        self.kick_events();
    }

    pub(crate) fn post_direct_io(self: &Arc<Self>, event: DirectIoEvent) {
        self.lock().events.push_back(Event::DirectIo(event));
        self.kick_events();
    }

    /// Drop buffered data events and input errors.
    pub(crate) fn discard_input_events(&self) {
        {
            let mut state = self.lock();
            let keep = |e: &Event| !e.waits_for_data_enabled();
            state.events.retain(keep);
            state.held.clear();
            state.set_data_count(0);
        }
        self.flush_notifications();
    }

    /// Start the firing task if something can be fired and none runs.
    pub(crate) fn kick_events(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.firing || !has_deliverable(&state) {
                return;
            }
            state.firing = true;
        }
        let props = self.clone();
        self.runtime.spawn(async move { props.fire_events().await });
    }

    async fn fire_events(self: Arc<Self>) {
        loop {
            let event = {
                let mut state = self.lock();
                match next_event(&mut state, self.options.strict_fifo) {
                    Some(event) => event,
                    None => {
                        state.firing = false;
                        break;
                    }
                }
            };
            self.flush_notifications();
            match event {
                Event::Error(error) => self.fire_error(error).await,
                event => {
                    debug!("{}: Fire {:?}", self.logical_name(), event);
                    self.listener.on_event(self.logical_name(), &event);
                }
            }
            self.signal_waiters();
        }
    }

    async fn fire_error(self: &Arc<Self>, event: ErrorEvent) {
        let chosen = self.listener.on_error(self.logical_name(), &event);
        let response = match event.locus.accept(chosen) {
            Some(response) => response,
            None => {
                warn!(
                    "{}: error response {:?} does not fit locus {:?}, using default",
                    self.logical_name(),
                    chosen,
                    event.locus
                );
                event.locus.default_response()
            }
        };
        debug!(
            "{}: Fire ErrorEvent: [{}/{:?}], response {:?}",
            self.logical_name(),
            event.code,
            event.locus,
            response
        );

        let Some(device) = self.device.upgrade() else {
            return;
        };
        let dispatcher = device.dispatcher();
        match response {
            ErrorResponse::Retry => dispatcher.reactivate(self),
            ErrorResponse::Clear => {
                let kind = locus_kind(event.locus);
                dispatcher.clear(self, Some(kind)).await;
                if kind == RequestKind::Input {
                    self.discard_input_events();
                }
            }
            ErrorResponse::ContinueInput => dispatcher.settle(self),
        }
    }
}
