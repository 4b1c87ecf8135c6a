use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, constants::FOREVER, error::DeviceError};

/// Claim policy of a device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusiveUse {
    /// A claim is required before the device can be enabled.
    Yes,
    /// Claiming is optional; once claimed only the claimer may mutate.
    Allowed,
    /// Shareable device, claiming is illegal.
    No,
}

impl fmt::Display for ExclusiveUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yes => write!(f, "exclusive"),
            Self::Allowed => write!(f, "exclusive-allowed"),
            Self::No => write!(f, "shareable"),
        }
    }
}

/// Service state as reported by the `State` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ControlState {
    /// Handle not open.
    Closed = 1,
    /// Open, no request outstanding.
    Idle = 2,
    /// At least one request queued or executing.
    Busy = 3,
    /// A request failed and its error event has not been answered yet.
    Error = 4,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Closed => "Closed",
            Self::Idle => "Idle",
            Self::Busy => "Busy",
            Self::Error => "Error",
        };
        write!(f, "{state}")
    }
}

/// Power state as reported by the `PowerState` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PowerState {
    Unknown = 2000,
    Online = 2001,
    Off = 2002,
    Offline = 2003,
    OffOffline = 2004,
}

/// Whether power status updates are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerNotify {
    Disabled,
    Enabled,
}

/// Power reporting capability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerReporting {
    /// No power reporting.
    None,
    /// Online and off-offline can be told apart.
    Standard,
    /// Online, offline and off can be told apart.
    Advanced,
}

/// Where an asynchronous error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorLocus {
    /// An output request failed.
    Output,
    /// An input request failed, no buffered data remains.
    Input,
    /// An input request failed while buffered data remains.
    InputData,
}

impl ErrorLocus {
    /// Response used when the listener does not choose one.
    #[must_use]
    pub fn default_response(self) -> ErrorResponse {
        match self {
            Self::Output => ErrorResponse::Retry,
            Self::Input => ErrorResponse::Clear,
            Self::InputData => ErrorResponse::ContinueInput,
        }
    }

    /// Checks a listener's response against this locus.
    ///
    /// `ContinueInput` is only meaningful for buffered input data; any
    /// response that does not fit falls back to the default.
    #[must_use]
    pub fn accept(self, response: ErrorResponse) -> Option<ErrorResponse> {
        match (self, response) {
            (Self::InputData, _) => Some(response),
            (_, ErrorResponse::ContinueInput) => None,
            _ => Some(response),
        }
    }
}

/// Listener's answer to an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorResponse {
    /// Retry the failed request(s).
    Retry,
    /// Drop the failed request(s) and the rest of that queue.
    Clear,
    /// Keep delivering buffered input data.
    ContinueInput,
}

/// Level of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthLevel {
    Internal,
    External,
    Interactive,
}

/// Timeout of a blocking wait.
///
/// UPOS APIs pass timeouts as milliseconds with [`FOREVER`] (`-1`) meaning
/// unbounded. [`WaitTimeout::from_millis`] is the single place where that
/// convention is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitTimeout {
    /// Wait at most this long. Zero means "do not wait at all".
    After(Duration),
    /// Wait until signalled.
    Forever,
}

impl WaitTimeout {
    /// Convert a UPOS millisecond timeout.
    ///
    /// # Errors
    /// Returns `DeviceError::IllegalArgument` for negative values other than
    /// `FOREVER`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use upos_core::WaitTimeout;
    ///
    /// assert_eq!(WaitTimeout::from_millis(-1).unwrap(), WaitTimeout::Forever);
    /// assert_eq!(
    ///     WaitTimeout::from_millis(250).unwrap(),
    ///     WaitTimeout::After(Duration::from_millis(250))
    /// );
    /// assert!(WaitTimeout::from_millis(-2).is_err());
    /// ```
    pub fn from_millis(millis: i64) -> Result<Self> {
        match millis {
            FOREVER => Ok(Self::Forever),
            m if m < 0 => Err(DeviceError::illegal_argument(format!(
                "Invalid timeout value: {m}"
            ))),
            m => Ok(Self::After(Duration::from_millis(m.unsigned_abs()))),
        }
    }

    /// Zero timeout.
    #[must_use]
    pub fn immediate() -> Self {
        Self::After(Duration::ZERO)
    }

    /// Returns `true` for a zero timeout.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::After(d) if d.is_zero())
    }

    /// Milliseconds for error messages; `u64::MAX` for `Forever`.
    #[must_use]
    pub fn as_millis(&self) -> u64 {
        match self {
            Self::After(d) => u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
            Self::Forever => u64::MAX,
        }
    }
}

/// Type of a property or parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "boolean"),
            Self::Int => write!(f, "integer"),
            Self::Text => write!(f, "string"),
        }
    }
}

/// Value of a category property or operation parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl PropertyValue {
    /// Type of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Text(_) => ValueKind::Text,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}
