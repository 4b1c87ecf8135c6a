//! Common test utilities for runtime integration tests.
//!
//! [`TestDriver`] is a scriptable device: it records every request it
//! executes, can be told to fail or to take its time, and exposes its event
//! sink through a cloneable [`TestHandle`] so tests can inject status and
//! data events the way real hardware would.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use upos_core::{DeviceError, ExclusiveUse, PowerReporting, PowerState, PropertyValue, Result};
use upos_runtime::delayed::DelayPolicy;
use upos_runtime::schema::{
    CategorySchema, Dispatch, OperationSpec, ParamSpec, PropertySpec, StatusRule,
};
use upos_runtime::{
    Capabilities, DataEvent, DeviceBlueprint, DeviceDriver, DeviceRegistry, EventSink, Params,
    PropertyState, RecordingListener, RequestContext, Service,
};

pub const STATUS_PRESENT: i32 = 1;
pub const STATUS_ABSENT: i32 = 2;
pub const STATUS_FULL: i32 = 3;
pub const STATUS_IDLE: i32 = 99;

/// One request as the driver saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub operation: String,
    pub params: Params,
    pub output_id: i32,
}

#[derive(Debug, Default)]
struct Shared {
    executed: Mutex<Vec<Executed>>,
    failures: Mutex<Vec<DeviceError>>,
    delay_ms: Mutex<u64>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    sink: Mutex<Option<EventSink>>,
    enables: Mutex<Vec<bool>>,
    hook_delay_ms: Mutex<u64>,
    hooks: Mutex<Vec<String>>,
}

impl Shared {
    /// Record entry into a hook, block like slow hardware, record the exit.
    fn hook(&self, name: &str) {
        self.hooks.lock().unwrap().push(format!("{name} begin"));
        let delay = *self.hook_delay_ms.lock().unwrap();
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.hooks.lock().unwrap().push(format!("{name} end"));
    }
}

/// Control side of a [`TestDriver`].
#[derive(Debug, Clone, Default)]
pub struct TestHandle {
    shared: Arc<Shared>,
}

impl TestHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next executions, one error per call, in order.
    pub fn fail_next(&self, error: DeviceError) {
        self.shared.failures.lock().unwrap().push(error);
    }

    /// Every request body sleeps this long (abortable).
    pub fn set_delay(&self, millis: u64) {
        *self.shared.delay_ms.lock().unwrap() = millis;
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.shared.executed.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.operation).collect()
    }

    /// Largest number of request bodies that ran at the same time.
    pub fn max_active(&self) -> usize {
        self.shared.max_active.load(Ordering::SeqCst)
    }

    pub fn enables(&self) -> Vec<bool> {
        self.shared.enables.lock().unwrap().clone()
    }

    /// The enable and set property hooks block the calling thread this long.
    pub fn set_hook_delay(&self, millis: u64) {
        *self.shared.hook_delay_ms.lock().unwrap() = millis;
    }

    /// Entry and exit of the enable and set property hooks, in order.
    pub fn hooks(&self) -> Vec<String> {
        self.shared.hooks.lock().unwrap().clone()
    }

    fn sink(&self) -> EventSink {
        self.shared
            .sink
            .lock()
            .unwrap()
            .clone()
            .expect("driver not attached")
    }

    pub fn status(&self, status: i32) {
        self.sink().status(status);
    }

    pub fn data(&self, value: i64) {
        self.sink().data(DataEvent::new(0).with("Value", value));
    }
}

/// Scriptable driver for the "Test" category.
#[derive(Debug)]
pub struct TestDriver {
    handle: TestHandle,
}

impl TestDriver {
    pub fn new() -> (Self, TestHandle) {
        let handle = TestHandle::new();
        (Self::with_handle(handle.clone()), handle)
    }

    pub fn with_handle(handle: TestHandle) -> Self {
        Self { handle }
    }
}

impl DeviceDriver for TestDriver {
    fn attach(&self, sink: EventSink) {
        *self.handle.shared.sink.lock().unwrap() = Some(sink);
    }

    fn open(&self, state: &mut PropertyState) -> Result<()> {
        state.set_capabilities(Capabilities {
            power_reporting: PowerReporting::Standard,
            ..Capabilities::default()
        });
        Ok(())
    }

    fn enable(&self, _props: &upos_runtime::PropertySet, enable: bool) -> Result<()> {
        self.handle.shared.hook(&format!("enable {enable}"));
        self.handle.shared.enables.lock().unwrap().push(enable);
        Ok(())
    }

    fn set_property(
        &self,
        _props: &upos_runtime::PropertySet,
        name: &str,
        _value: &PropertyValue,
    ) -> Result<()> {
        self.handle.shared.hook(&format!("set {name}"));
        Ok(())
    }

    fn power_state(&self) -> PowerState {
        PowerState::Online
    }

    fn execute<'a>(&'a self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let shared = &self.handle.shared;
            let active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
            shared.max_active.fetch_max(active, Ordering::SeqCst);
            shared.executed.lock().unwrap().push(Executed {
                operation: ctx.operation().to_string(),
                params: ctx.params().clone(),
                output_id: ctx.output_id(),
            });

            let delay = *shared.delay_ms.lock().unwrap();
            let result = if delay > 0 && !ctx.sleep(Duration::from_millis(delay)).await {
                Err(DeviceError::aborted(ctx.operation()))
            } else {
                let mut failures = shared.failures.lock().unwrap();
                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(failures.remove(0))
                }
            };

            if result.is_ok() && ctx.operation() == "read" {
                let value = ctx.params().int("value").unwrap_or(0);
                self.handle.data(value);
            }
            shared.active.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

/// Category used by the runtime tests.
pub fn test_schema(exclusive_use: ExclusiveUse) -> CategorySchema {
    CategorySchema::builder("Test")
        .exclusive_use(exclusive_use)
        .property(PropertySpec::read_only("Present", false))
        .property(PropertySpec::read_only("Full", false))
        .property(PropertySpec::read_only("CapFlash", false))
        .property(PropertySpec::read_only("Value", 0).input_data())
        .property(PropertySpec::read_write("Level", 5).range(0, 10))
        .property(PropertySpec::read_write("Timeout", 0).range(0, i64::MAX))
        .property(
            PropertySpec::read_write("FlashRate", 1)
                .gated_by("CapFlash")
                .readable_after_enable(),
        )
        .operation(
            OperationSpec::output("print")
                .dispatch(Dispatch::AsyncCapable)
                .param(ParamSpec::text("text")),
        )
        .operation(OperationSpec::output("beep"))
        .operation(
            OperationSpec::output("chime")
                .dispatch(Dispatch::Asynchronous)
                .concurrent(true),
        )
        .operation(OperationSpec::output("flash").gated_by("CapFlash"))
        .operation(
            OperationSpec::input("read")
                .dispatch(Dispatch::Asynchronous)
                .param(ParamSpec::int("value")),
        )
        .status(
            StatusRule::new(STATUS_PRESENT, "Present")
                .sets("Present", true)
                .delayed(DelayPolicy::CancelOnly),
        )
        .status(
            StatusRule::new(STATUS_ABSENT, "Absent")
                .sets("Present", false)
                .delayed(DelayPolicy::AfterProperty("Timeout")),
        )
        .status(StatusRule::new(STATUS_FULL, "Full").sets("Full", true))
        .idle_status(STATUS_IDLE)
        .build()
        .unwrap()
}

/// Open a handle named `name` on `physical_id`.
pub fn open_on(
    registry: &DeviceRegistry,
    name: &str,
    physical_id: &str,
    handle: &TestHandle,
    exclusive_use: ExclusiveUse,
) -> (Service, Arc<RecordingListener>) {
    let listener = Arc::new(RecordingListener::new());
    let driver_handle = handle.clone();
    let service = Service::open(
        registry,
        name,
        physical_id,
        move || {
            Ok(DeviceBlueprint::new(
                test_schema(exclusive_use),
                TestDriver::with_handle(driver_handle),
            ))
        },
        listener.clone(),
    )
    .unwrap();
    (service, listener)
}

pub fn open(registry: &DeviceRegistry, handle: &TestHandle) -> (Service, Arc<RecordingListener>) {
    open_on(registry, "test", "test:0", handle, ExclusiveUse::Yes)
}

/// Open, claim and enable.
pub async fn open_enabled(
    registry: &DeviceRegistry,
    handle: &TestHandle,
) -> (Service, Arc<RecordingListener>) {
    let (service, listener) = open(registry, handle);
    service.claim(0).await.unwrap();
    service.set_device_enabled(true).unwrap();
    (service, listener)
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
