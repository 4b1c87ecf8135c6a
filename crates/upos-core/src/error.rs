//! Error types for device operations.
//!
//! Every failure a caller can observe is a [`DeviceError`]. The variant is the
//! error category (wrong state, bad argument, expired wait, failing hardware,
//! missing capability); each error also carries the numeric UPOS result code
//! and an extended code so that callers speaking the numeric protocol can map
//! it back.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Numeric UPOS result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    /// Handle is not open.
    Closed = 101,
    /// Device is claimed, by this or another handle.
    Claimed = 102,
    /// Operation requires a claim.
    NotClaimed = 103,
    /// No service could be found for the device.
    NoService = 104,
    /// Operation requires an enabled device.
    Disabled = 105,
    /// Illegal call or parameter.
    Illegal = 106,
    /// Hardware is not present.
    NoHardware = 107,
    /// Hardware is present but offline.
    Offline = 108,
    /// Referenced object does not exist.
    NoExist = 109,
    /// Object already exists.
    Exists = 110,
    /// Generic hardware or service failure.
    Failure = 111,
    /// Blocking wait exceeded its deadline.
    Timeout = 112,
    /// Device is busy with another request.
    Busy = 113,
    /// Category specific failure, see extended code.
    Extended = 114,
}

impl ErrorCode {
    /// The numeric code as transported on the UPOS API.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "E_CLOSED",
            Self::Claimed => "E_CLAIMED",
            Self::NotClaimed => "E_NOTCLAIMED",
            Self::NoService => "E_NOSERVICE",
            Self::Disabled => "E_DISABLED",
            Self::Illegal => "E_ILLEGAL",
            Self::NoHardware => "E_NOHARDWARE",
            Self::Offline => "E_OFFLINE",
            Self::NoExist => "E_NOEXIST",
            Self::Exists => "E_EXISTS",
            Self::Failure => "E_FAILURE",
            Self::Timeout => "E_TIMEOUT",
            Self::Busy => "E_BUSY",
            Self::Extended => "E_EXTENDED",
        };
        write!(f, "{name}")
    }
}

/// Coarse error category, independent of the numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong open/claim/enable state.
    IllegalState,
    /// Parameter outside its allowed set or range.
    IllegalArgument,
    /// Blocking wait exceeded the caller's deadline.
    Timeout,
    /// Underlying I/O or OS call failed.
    HardwareFailure,
    /// Capability flag denies the request.
    NotSupported,
}

/// Errors returned by services, dispatchers and device drivers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// Operation is not legal in the current open/claim/enable state.
    #[error("Illegal state ({code}): {message}")]
    IllegalState { code: ErrorCode, message: String },

    /// A parameter or property value is outside its allowed set or range.
    #[error("Illegal argument: {message}")]
    IllegalArgument { message: String },

    /// A blocking wait exceeded its deadline.
    #[error("Timeout after {duration_ms}ms: {message}")]
    Timeout { duration_ms: u64, message: String },

    /// The device or the OS call behind it failed.
    #[error("Hardware failure ({code}/{extended}): {message}")]
    HardwareFailure {
        code: ErrorCode,
        extended: i32,
        message: String,
    },

    /// The device does not have the capability the request needs.
    #[error("Not supported: {operation}")]
    NotSupported { operation: String },
}

impl DeviceError {
    /// Handle is closed.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::IllegalState {
            code: ErrorCode::Closed,
            message: message.into(),
        }
    }

    /// Device is claimed by this or another handle.
    pub fn claimed(message: impl Into<String>) -> Self {
        Self::IllegalState {
            code: ErrorCode::Claimed,
            message: message.into(),
        }
    }

    /// Operation requires a claim the caller does not hold.
    pub fn not_claimed(message: impl Into<String>) -> Self {
        Self::IllegalState {
            code: ErrorCode::NotClaimed,
            message: message.into(),
        }
    }

    /// Operation requires an enabled device.
    pub fn disabled(message: impl Into<String>) -> Self {
        Self::IllegalState {
            code: ErrorCode::Disabled,
            message: message.into(),
        }
    }

    /// Device is busy.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::IllegalState {
            code: ErrorCode::Busy,
            message: message.into(),
        }
    }

    /// Generic illegal state.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            code: ErrorCode::Illegal,
            message: message.into(),
        }
    }

    /// Parameter or value out of range.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Blocking wait timed out.
    pub fn timeout(duration_ms: u64, message: impl Into<String>) -> Self {
        Self::Timeout {
            duration_ms,
            message: message.into(),
        }
    }

    /// Generic hardware failure.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::HardwareFailure {
            code: ErrorCode::Failure,
            extended: 0,
            message: message.into(),
        }
    }

    /// Hardware is offline.
    pub fn offline(message: impl Into<String>) -> Self {
        Self::HardwareFailure {
            code: ErrorCode::Offline,
            extended: 0,
            message: message.into(),
        }
    }

    /// Category specific failure with an extended code.
    pub fn extended(extended: i32, message: impl Into<String>) -> Self {
        Self::HardwareFailure {
            code: ErrorCode::Extended,
            extended,
            message: message.into(),
        }
    }

    /// Capability missing.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// A request was aborted before or while it ran.
    pub fn aborted(operation: impl Into<String>) -> Self {
        Self::failure(format!("{} aborted", operation.into()))
    }

    /// Category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IllegalState { .. } => ErrorKind::IllegalState,
            Self::IllegalArgument { .. } => ErrorKind::IllegalArgument,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::HardwareFailure { .. } => ErrorKind::HardwareFailure,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
        }
    }

    /// Numeric UPOS result code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::IllegalState { code, .. } | Self::HardwareFailure { code, .. } => *code,
            Self::IllegalArgument { .. } | Self::NotSupported { .. } => ErrorCode::Illegal,
            Self::Timeout { .. } => ErrorCode::Timeout,
        }
    }

    /// Extended result code, zero unless the device reported one.
    #[must_use]
    pub fn extended_code(&self) -> i32 {
        match self {
            Self::HardwareFailure { extended, .. } => *extended,
            _ => 0,
        }
    }

    /// Message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::IllegalState { message, .. }
            | Self::IllegalArgument { message }
            | Self::Timeout { message, .. }
            | Self::HardwareFailure { message, .. } => message,
            Self::NotSupported { operation } => operation,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> Self {
        Self::failure(error.to_string())
    }
}
