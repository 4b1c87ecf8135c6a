//! Physical devices and the registry that shares them between handles.
//!
//! Opening the same physical device twice yields two handles with separate
//! property sets but one driver, one claim table and one request queue. The
//! registry creates the device on the first open and forgets it when the
//! last handle closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, info};
use upos_core::{ControlState, Result};

use crate::claim::ClaimTable;
use crate::config::RuntimeOptions;
use crate::dispatcher::Dispatcher;
use crate::driver::{DeviceDriver, EventSink};
use crate::listener::EventListener;
use crate::properties::{PropertySet, SessionId};
use crate::schema::CategorySchema;
use crate::service::Service;

/// What a factory produces for a physical device.
#[derive(Clone)]
pub struct DeviceBlueprint {
    pub schema: Arc<CategorySchema>,
    pub driver: Arc<dyn DeviceDriver>,
}

impl DeviceBlueprint {
    pub fn new(schema: CategorySchema, driver: impl DeviceDriver) -> Self {
        Self {
            schema: Arc::new(schema),
            driver: Arc::new(driver),
        }
    }
}

impl std::fmt::Debug for DeviceBlueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBlueprint")
            .field("category", &self.schema.name())
            .finish_non_exhaustive()
    }
}

/// One physical device shared by every handle opened on it.
///
/// Lock order: the control lock first, then the claim table, the request
/// queue and the session list, and only then a property set lock.
pub(crate) struct DeviceInner {
    physical_id: String,
    schema: Arc<CategorySchema>,
    driver: Arc<dyn DeviceDriver>,
    claims: ClaimTable,
    dispatcher: Dispatcher,
    sessions: Mutex<Vec<Arc<PropertySet>>>,
    control: Mutex<()>,
    deferring: AtomicUsize,
}

/// Holds the device control lock. Property change notifications of the
/// device are held back until it drops.
pub(crate) struct ControlGuard<'a> {
    device: &'a DeviceInner,
    guard: Option<MutexGuard<'a, ()>>,
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.device.deferring.fetch_sub(1, Ordering::AcqRel);
        for props in self.device.sessions() {
            props.flush_notifications();
        }
    }
}

impl DeviceInner {
    pub(crate) fn physical_id(&self) -> &str {
        &self.physical_id
    }

    pub(crate) fn schema(&self) -> &Arc<CategorySchema> {
        &self.schema
    }

    pub(crate) fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub(crate) fn claims(&self) -> &ClaimTable {
        &self.claims
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serialize a state check, the driver hook it guards and the resulting
    /// property update against every other such sequence on the device.
    pub(crate) fn control(&self) -> ControlGuard<'_> {
        let guard = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        self.deferring.fetch_add(1, Ordering::AcqRel);
        ControlGuard {
            device: self,
            guard: Some(guard),
        }
    }

    /// A control lock is held; listener callbacks must wait for it to drop.
    pub(crate) fn defers_notifications(&self) -> bool {
        self.deferring.load(Ordering::Acquire) > 0
    }

    fn sessions_lock(&self) -> MutexGuard<'_, Vec<Arc<PropertySet>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every open handle.
    pub(crate) fn sessions(&self) -> Vec<Arc<PropertySet>> {
        self.sessions_lock().clone()
    }

    /// Receivers of data and error events: the claimer, or every handle if
    /// the device is not claimed.
    pub(crate) fn targets(&self) -> Vec<Arc<PropertySet>> {
        let claimer = self.claims.claimer();
        let sessions = self.sessions();
        match claimer {
            Some(claimer) => sessions
                .into_iter()
                .filter(|p| p.session() == claimer)
                .collect(),
            None => sessions,
        }
    }

    fn remove_session(&self, session: SessionId) -> bool {
        let mut sessions = self.sessions_lock();
        sessions.retain(|p| p.session() != session);
        sessions.is_empty()
    }
}

impl std::fmt::Debug for DeviceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInner")
            .field("physical_id", &self.physical_id)
            .field("category", &self.schema.name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: Mutex<HashMap<String, Arc<DeviceInner>>>,
    next_session: AtomicU64,
    options: RuntimeOptions,
}

/// Physical devices currently in use, keyed by physical id.
///
/// Cheap to clone; clones share the same devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                options,
                ..RegistryInner::default()
            }),
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<String, Arc<DeviceInner>>> {
        self.inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of physical devices with at least one open handle.
    pub fn device_count(&self) -> usize {
        self.devices().len()
    }

    pub fn is_open(&self, physical_id: &str) -> bool {
        self.devices().contains_key(physical_id)
    }

    /// Open a new handle on `physical_id`.
    ///
    /// `factory` is only called if the device is not open yet. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the factory or the driver's open hook fails.
    pub fn open<F>(
        &self,
        logical_name: &str,
        physical_id: &str,
        factory: F,
        listener: Arc<dyn EventListener>,
    ) -> Result<Service>
    where
        F: FnOnce() -> Result<DeviceBlueprint>,
    {
        let runtime = Handle::current();
        let (device, created) = {
            let mut devices = self.devices();
            match devices.get(physical_id) {
                Some(device) => (device.clone(), false),
                None => {
                    let blueprint = factory()?;
                    let device = Arc::new(DeviceInner {
                        physical_id: physical_id.to_string(),
                        dispatcher: Dispatcher::new(
                            physical_id,
                            blueprint.driver.clone(),
                            runtime.clone(),
                        ),
                        schema: blueprint.schema,
                        driver: blueprint.driver,
                        claims: ClaimTable::new(),
                        sessions: Mutex::new(Vec::new()),
                        control: Mutex::new(()),
                        deferring: AtomicUsize::new(0),
                    });
                    devices.insert(physical_id.to_string(), device.clone());
                    (device, true)
                }
            }
        };
        if created {
            info!(
                "Attach {} device {}",
                device.schema().name(),
                device.physical_id()
            );
            device
                .driver()
                .attach(EventSink::new(Arc::downgrade(&device)));
        }

        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let props = Arc::new(PropertySet::new(
            session,
            logical_name,
            device.schema().clone(),
            listener,
            self.inner.options.clone(),
            runtime,
            Arc::downgrade(&device),
        ));

        let opened = {
            let mut state = props.lock();
            let result = device.driver().open(&mut state);
            // The application never saw the initial values.
            state.take_notifications();
            result
        };
        if let Err(e) = opened {
            props.lock().set_state(ControlState::Closed);
            if created {
                self.devices().remove(physical_id);
            }
            return Err(e);
        }

        device.sessions_lock().push(props.clone());
        debug!(
            "{}: opened as session {} on {}",
            logical_name, session, physical_id
        );
        Ok(Service::new(self.clone(), device, props))
    }

    /// Forget `session`; drops the device when it was the last handle.
    pub(crate) fn close_session(&self, device: &Arc<DeviceInner>, session: SessionId) {
        let mut devices = self.devices();
        if device.remove_session(session) {
            info!(
                "Detach {} device {}",
                device.schema().name(),
                device.physical_id()
            );
            devices.remove(device.physical_id());
        }
    }
}
