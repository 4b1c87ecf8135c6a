//! Device driver contract.
//!
//! A driver implements the device specific side of a category: it executes
//! validated requests and reports what the hardware does through its
//! [`EventSink`]. Everything else (claims, state checks, queueing, event
//! delivery) is done by the runtime.
//!
//! Drivers are shared between every handle opened on the same physical
//! device, so the trait is used as `Arc<dyn DeviceDriver>` and the request
//! body returns a boxed future.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tracing::debug;
use upos_core::{DeviceError, HealthLevel, PowerState, PropertyValue, Result};

use crate::device::DeviceInner;
use crate::event::{DataEvent, DirectIoEvent, ErrorEvent};
use crate::properties::{PropertySet, PropertyState, SessionId};
use crate::request::RequestContext;

/// Device specific half of a service.
///
/// Every hook except [`execute`](Self::execute) has a default that accepts
/// the call. The claim, release, enable, health, property and direct I/O
/// hooks run with the device control lock held, one at a time per device.
pub trait DeviceDriver: Send + Sync + 'static {
    /// Called once, when the first handle opens the physical device.
    fn attach(&self, sink: EventSink) {
        let _ = sink;
    }

    /// Initialize a freshly opened handle: capabilities and category
    /// property values. Runs with the property lock held.
    fn open(&self, state: &mut PropertyState) -> Result<()> {
        let _ = state;
        Ok(())
    }

    fn close(&self, session: SessionId) {
        let _ = session;
    }

    /// The runtime already holds the claim for `session`. Failing here gives
    /// it back.
    fn claim(&self, session: SessionId) -> Result<()> {
        let _ = session;
        Ok(())
    }

    fn release(&self, session: SessionId) -> Result<()> {
        let _ = session;
        Ok(())
    }

    fn enable(&self, props: &PropertySet, enable: bool) -> Result<()> {
        let _ = (props, enable);
        Ok(())
    }

    /// Power state reported when power notification is enabled.
    fn power_state(&self) -> PowerState {
        PowerState::Online
    }

    /// Run a health check and return the text for `CheckHealthText`.
    fn check_health(&self, props: &PropertySet, level: HealthLevel) -> Result<String> {
        let _ = props;
        Ok(format!("{level:?} check: OK"))
    }

    /// A writable category property is about to change. The value already
    /// passed the schema validator.
    fn set_property(&self, props: &PropertySet, name: &str, value: &PropertyValue) -> Result<()> {
        let _ = (props, name, value);
        Ok(())
    }

    /// Vendor specific command.
    fn direct_io(
        &self,
        props: &PropertySet,
        command: i32,
        data: i64,
        payload: &str,
    ) -> Result<(i64, String)> {
        let _ = (props, data, payload);
        Err(DeviceError::unsupported(format!("directIO command {command}")))
    }

    /// Body of one operation call.
    ///
    /// Long running bodies should poll [`RequestContext::checkpoint`] or use
    /// [`RequestContext::sleep`] so that clear and close can abort them.
    fn execute<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>>;
}

/// Event producer handed to a driver on attach.
///
/// Status events go to every open handle of the device. Data, error and
/// direct I/O events go to the claiming handle, or to every enabled handle
/// if nobody holds the claim.
#[derive(Debug, Clone)]
pub struct EventSink {
    device: Weak<DeviceInner>,
}

impl EventSink {
    pub(crate) fn new(device: Weak<DeviceInner>) -> Self {
        Self { device }
    }

    /// The device still has open handles.
    pub fn is_attached(&self) -> bool {
        self.device.strong_count() > 0
    }

    fn all(&self) -> Vec<Arc<PropertySet>> {
        match self.device.upgrade() {
            Some(device) => device.sessions(),
            None => Vec::new(),
        }
    }

    fn targets(&self) -> Vec<Arc<PropertySet>> {
        match self.device.upgrade() {
            Some(device) => device.targets(),
            None => Vec::new(),
        }
    }

    pub fn status(&self, status: i32) {
        let sessions = self.all();
        debug!("Status {} for {} handle(s)", status, sessions.len());
        for props in sessions {
            props.post_status(status);
        }
    }

    pub fn data(&self, event: DataEvent) {
        for props in self.targets() {
            props.post_data(event.clone());
        }
    }

    pub fn error(&self, event: ErrorEvent) {
        for props in self.targets() {
            props.post_error(event.clone());
        }
    }

    pub fn direct_io(&self, event: DirectIoEvent) {
        for props in self.targets() {
            props.post_direct_io(event.clone());
        }
    }
}
