//! Device runtime for UPOS style point-of-sale peripherals.
//!
//! The runtime implements everything device categories have in common and
//! leaves only the device specific part to a [`DeviceDriver`]:
//!
//! - the open/claim/enable state machine and its guards ([`claim`])
//! - per-handle property state with change notification ([`properties`])
//! - a serialized request queue with abort, retry and clear
//! - buffered event delivery honouring `FreezeEvents` and
//!   `DataEventEnabled` ([`event`]), including delayed status events
//!   ([`delayed`])
//! - a declarative description of each category ([`schema`])
//! - the application façade ([`Service`]) and the registry that shares a
//!   physical device between handles ([`DeviceRegistry`])
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use futures::future::BoxFuture;
//! use upos_core::ControlState;
//! use upos_runtime::schema::{CategorySchema, OperationSpec, PropertySpec, StatusRule};
//! use upos_runtime::{
//!     DeviceBlueprint, DeviceDriver, DeviceRegistry, RecordingListener, RequestContext, Service,
//! };
//!
//! struct Bell;
//!
//! impl DeviceDriver for Bell {
//!     fn execute<'a>(&'a self, _ctx: &'a RequestContext) -> BoxFuture<'a, upos_core::Result<()>> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> upos_core::Result<()> {
//!     let registry = DeviceRegistry::new();
//!     let listener = Arc::new(RecordingListener::new());
//!
//!     let bell = Service::open(&registry, "bell", "sim:bell:0", || {
//!         let schema = CategorySchema::builder("Bell")
//!             .property(PropertySpec::read_only("Ringing", false))
//!             .operation(OperationSpec::output("ring"))
//!             .status(StatusRule::new(1, "Ringing").sets("Ringing", true))
//!             .build()?;
//!         Ok(DeviceBlueprint::new(schema, Bell))
//!     }, listener)?;
//!
//!     bell.claim(0).await?;
//!     bell.set_device_enabled(true)?;
//!     bell.invoke("ring", Default::default()).await?;
//!     bell.close().await?;
//!     assert_eq!(bell.state(), ControlState::Closed);
//!     Ok(())
//! }
//! ```

pub mod claim;
pub mod config;
pub mod delayed;
pub mod device;
mod dispatcher;
pub mod driver;
pub mod event;
pub mod listener;
pub mod properties;
pub mod request;
pub mod schema;
pub mod service;
pub mod sync;

pub use claim::ClaimTable;
pub use config::{ConfigError, DeviceEntry, PropertyBag, RuntimeConfig, RuntimeOptions};
pub use delayed::DelayPolicy;
pub use device::{DeviceBlueprint, DeviceRegistry};
pub use driver::{DeviceDriver, EventSink};
pub use event::{DataEvent, DirectIoEvent, ErrorEvent, Event, StatusUpdate};
pub use listener::{EventListener, NullListener, RecordedEvent, RecordingListener};
pub use properties::{Capabilities, PropertyChange, PropertySet, PropertyState, SessionId};
pub use request::{Params, RequestContext, RequestHandle, RequestKind, RequestOutcome};
pub use schema::CategorySchema;
pub use service::Service;
pub use sync::SyncObject;
