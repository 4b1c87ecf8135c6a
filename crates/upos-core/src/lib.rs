//! Shared vocabulary of the UPOS device runtime.
//!
//! Error taxonomy, numeric result codes, the state enums every property set
//! carries and the status constants common to all device categories.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{DeviceError, ErrorCode, ErrorKind, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
