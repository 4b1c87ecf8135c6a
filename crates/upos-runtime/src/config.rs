//! Device configuration.
//!
//! Devices are listed in a TOML file:
//!
//! ```toml
//! [runtime]
//! strict_fifo = false
//!
//! [[device]]
//! logical_name = "drawer"
//! category = "CashDrawer"
//! physical_id = "sim:drawer:0"
//!
//! [device.properties]
//! open_delay_ms = "200"
//! ```
//!
//! The `properties` bag is untyped; each driver converts the keys it knows
//! once, at construction, through the typed getters of [`PropertyBag`].

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use upos_core::DeviceError;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Logical name {0} configured twice")]
    DuplicateName(String),

    #[error("Unknown device category: {0}")]
    UnknownCategory(String),
}

impl From<ConfigError> for DeviceError {
    fn from(error: ConfigError) -> Self {
        DeviceError::illegal_argument(error.to_string())
    }
}

/// Runtime wide switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Deliver events strictly in generation order: a data event waiting
    /// for `DataEventEnabled` holds back every later event.
    #[serde(default)]
    pub strict_fifo: bool,
}

/// String keyed driver settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBag(BTreeMap<String, toml::Value>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn invalid(key: &str, value: &toml::Value) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(toml::Value::as_str)
    }

    /// Integer value of `key`. Strings holding a number are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the value is not an integer.
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::Integer(v)) => Ok(Some(*v)),
            Some(value @ toml::Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Self::invalid(key, value)),
            Some(value) => Err(Self::invalid(key, value)),
        }
    }

    /// Non-negative integer value of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for negative or non-integer
    /// values.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.get_i64(key)? {
            None => Ok(None),
            Some(v) => u64::try_from(v)
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: v.to_string(),
                }),
        }
    }

    /// Boolean value of `key`. The strings `"true"` and `"false"` are
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything else.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::Boolean(v)) => Ok(Some(*v)),
            Some(value @ toml::Value::String(s)) => match s.trim() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(Self::invalid(key, value)),
            },
            Some(value) => Err(Self::invalid(key, value)),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        Ok(self.get_u64(key)?.unwrap_or(default))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }
}

/// One configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub logical_name: String,
    pub category: String,
    pub physical_id: String,
    #[serde(default)]
    pub properties: PropertyBag,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeOptions,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

impl RuntimeConfig {
    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Fails on malformed TOML or duplicate logical names.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        let mut names = HashSet::new();
        for device in &config.devices {
            if !names.insert(device.logical_name.as_str()) {
                return Err(ConfigError::DuplicateName(device.logical_name.clone()));
            }
        }
        Ok(config)
    }

    /// Load and parse the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Entry for `logical_name`.
    pub fn device(&self, logical_name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.logical_name == logical_name)
    }
}
