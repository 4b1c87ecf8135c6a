//! Declarative description of a device category.
//!
//! A category is data: the properties it exposes, the operations it accepts,
//! the status codes it understands and what each of them does to the
//! property set. The service façade enforces every precondition and
//! validator listed here before it calls into the driver, so a driver only
//! ever sees requests that already passed validation.
//!
//! # Examples
//!
//! ```
//! use upos_core::ExclusiveUse;
//! use upos_runtime::schema::{CategorySchema, OperationSpec, ParamSpec, PropertySpec, StatusRule};
//!
//! let schema = CategorySchema::builder("Lights")
//!     .exclusive_use(ExclusiveUse::Yes)
//!     .property(PropertySpec::read_only("MaxLights", 4))
//!     .property(PropertySpec::read_only("LightOn", false))
//!     .operation(
//!         OperationSpec::output("switchOn")
//!             .param(ParamSpec::int("lightNumber").range(1, 4)),
//!     )
//!     .status(StatusRule::new(1, "Light switched on").sets("LightOn", true))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(schema.name(), "Lights");
//! assert!(schema.operation("switchOn").is_some());
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use upos_core::{DeviceError, ExclusiveUse, PropertyValue, Result, ValueKind};

use crate::delayed::DelayPolicy;
use crate::properties::{Capabilities, PropertyState};
use crate::request::{Params, RequestKind};

/// Validates a single value against the current property state.
pub type Validator = Arc<dyn Fn(&PropertyValue, &PropertyState) -> Result<()> + Send + Sync>;

/// Cross-parameter check of an operation call.
pub type OperationCheck = Arc<dyn Fn(&Params, &PropertyState) -> Result<()> + Send + Sync>;

/// State a handle must be in before an access is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precondition {
    /// Handle is open.
    Opened,
    /// Handle is open and the device has been enabled at least once.
    FirstEnabled,
    /// Handle holds the claim (exclusive devices only).
    Claimed,
    /// Device is claimed where required and enabled.
    Enabled,
    /// Device is enabled and not claimed by another handle.
    EnabledUnclaimed,
}

/// Write access of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite(Precondition),
}

/// Returns a validator accepting integers in `min..=max`.
pub fn range(min: i64, max: i64) -> Validator {
    Arc::new(move |value, _| match value.as_int() {
        Some(v) if (min..=max).contains(&v) => Ok(()),
        _ => Err(DeviceError::illegal_argument(format!(
            "Value {value} out of range {min}..{max}"
        ))),
    })
}

/// Returns a validator accepting only the listed integers.
pub fn one_of(allowed: &'static [i64]) -> Validator {
    Arc::new(move |value, _| match value.as_int() {
        Some(v) if allowed.contains(&v) => Ok(()),
        _ => Err(DeviceError::illegal_argument(format!(
            "Value {value} not one of {allowed:?}"
        ))),
    })
}

fn check_kind(name: &str, expected: ValueKind, value: &PropertyValue) -> Result<()> {
    if value.kind() == expected {
        Ok(())
    } else {
        Err(DeviceError::illegal_argument(format!(
            "{name}: expected {expected}, got {}",
            value.kind()
        )))
    }
}

/// One category property.
#[derive(Clone)]
pub struct PropertySpec {
    name: &'static str,
    default: PropertyValue,
    access: Access,
    read_requires: Precondition,
    capability: Option<&'static str>,
    validator: Option<Validator>,
    input_data: bool,
}

impl PropertySpec {
    /// Property only the device changes.
    pub fn read_only(name: &'static str, default: impl Into<PropertyValue>) -> Self {
        Self {
            name,
            default: default.into(),
            access: Access::ReadOnly,
            read_requires: Precondition::Opened,
            capability: None,
            validator: None,
            input_data: false,
        }
    }

    /// Property the application may set while the device is enabled.
    pub fn read_write(name: &'static str, default: impl Into<PropertyValue>) -> Self {
        Self {
            access: Access::ReadWrite(Precondition::Enabled),
            ..Self::read_only(name, default)
        }
    }

    /// Change the precondition for writes.
    #[must_use]
    pub fn requires(mut self, precondition: Precondition) -> Self {
        if let Access::ReadWrite(_) = self.access {
            self.access = Access::ReadWrite(precondition);
        }
        self
    }

    /// The value is only meaningful once the device has been enabled.
    #[must_use]
    pub fn readable_after_enable(mut self) -> Self {
        self.read_requires = Precondition::FirstEnabled;
        self
    }

    /// Writes fail with `NotSupported` unless boolean property `capability`
    /// is `true`.
    #[must_use]
    pub fn gated_by(mut self, capability: &'static str) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Add a value validator.
    #[must_use]
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&PropertyValue, &PropertyState) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Accept integers in `min..=max` only.
    #[must_use]
    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.validator = Some(range(min, max));
        self
    }

    /// The value is filled by data events and reset by
    /// `clear_input_properties`.
    #[must_use]
    pub fn input_data(mut self) -> Self {
        self.input_data = true;
        self
    }

    pub fn is_input_data(&self) -> bool {
        self.input_data
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_value(&self) -> &PropertyValue {
        &self.default
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn read_requires(&self) -> Precondition {
        self.read_requires
    }

    pub fn capability(&self) -> Option<&'static str> {
        self.capability
    }

    pub fn kind(&self) -> ValueKind {
        self.default.kind()
    }

    pub(crate) fn check(&self, value: &PropertyValue, state: &PropertyState) -> Result<()> {
        check_kind(self.name, self.kind(), value)?;
        match &self.validator {
            Some(validator) => validator(value, state),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PropertySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySpec")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("access", &self.access)
            .field("read_requires", &self.read_requires)
            .field("capability", &self.capability)
            .field("validated", &self.validator.is_some())
            .field("input_data", &self.input_data)
            .finish()
    }
}

/// One operation parameter.
#[derive(Clone)]
pub struct ParamSpec {
    name: &'static str,
    kind: ValueKind,
    validator: Option<Validator>,
}

impl ParamSpec {
    fn new(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            validator: None,
        }
    }

    pub fn int(name: &'static str) -> Self {
        Self::new(name, ValueKind::Int)
    }

    pub fn bool(name: &'static str) -> Self {
        Self::new(name, ValueKind::Bool)
    }

    pub fn text(name: &'static str) -> Self {
        Self::new(name, ValueKind::Text)
    }

    #[must_use]
    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.validator = Some(range(min, max));
        self
    }

    #[must_use]
    pub fn one_of(mut self, allowed: &'static [i64]) -> Self {
        self.validator = Some(one_of(allowed));
        self
    }

    #[must_use]
    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&PropertyValue, &PropertyState) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

/// How an operation reaches the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Always waits for completion.
    Synchronous,
    /// Queued when `AsyncMode` is set, otherwise waits for completion.
    AsyncCapable,
    /// Always queued.
    Asynchronous,
}

/// One category operation.
#[derive(Clone)]
pub struct OperationSpec {
    name: &'static str,
    kind: RequestKind,
    dispatch: Dispatch,
    precondition: Precondition,
    params: Vec<ParamSpec>,
    capability: Option<&'static str>,
    concurrent: bool,
    check: Option<OperationCheck>,
}

impl OperationSpec {
    fn new(name: &'static str, kind: RequestKind) -> Self {
        Self {
            name,
            kind,
            dispatch: Dispatch::Synchronous,
            precondition: Precondition::Enabled,
            params: Vec::new(),
            capability: None,
            concurrent: false,
            check: None,
        }
    }

    /// Synchronous output operation requiring an enabled device.
    pub fn output(name: &'static str) -> Self {
        Self::new(name, RequestKind::Output)
    }

    /// Synchronous input operation requiring an enabled device.
    pub fn input(name: &'static str) -> Self {
        Self::new(name, RequestKind::Input)
    }

    #[must_use]
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    #[must_use]
    pub fn requires(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    #[must_use]
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn gated_by(mut self, capability: &'static str) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Asynchronous requests of this operation run next to the serialized
    /// queue instead of inside it.
    #[must_use]
    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Add a check over all parameters, run after the per-parameter ones.
    #[must_use]
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Params, &PropertyState) -> Result<()> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn dispatch_mode(&self) -> Dispatch {
        self.dispatch
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn capability(&self) -> Option<&'static str> {
        self.capability
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// Validate a call's parameters.
    pub(crate) fn validate(&self, params: &Params, state: &PropertyState) -> Result<()> {
        for (name, _) in params.iter() {
            if !self.params.iter().any(|p| p.name == name) {
                return Err(DeviceError::illegal_argument(format!(
                    "{}: unknown parameter {name}",
                    self.name
                )));
            }
        }
        for spec in &self.params {
            let value = params.get(spec.name).ok_or_else(|| {
                DeviceError::illegal_argument(format!(
                    "{}: missing parameter {}",
                    self.name, spec.name
                ))
            })?;
            check_kind(spec.name, spec.kind, value)?;
            if let Some(validator) = &spec.validator {
                validator(value, state)?;
            }
        }
        match &self.check {
            Some(check) => check(params, state),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dispatch", &self.dispatch)
            .field("precondition", &self.precondition)
            .field("params", &self.params)
            .field("capability", &self.capability)
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

/// What a category status code does to the property set.
#[derive(Debug, Clone)]
pub struct StatusRule {
    status: i32,
    label: &'static str,
    effects: Vec<(&'static str, PropertyValue)>,
    delay: DelayPolicy,
}

impl StatusRule {
    pub fn new(status: i32, label: &'static str) -> Self {
        Self {
            status,
            label,
            effects: Vec::new(),
            delay: DelayPolicy::Immediate,
        }
    }

    /// Delivering the status sets `property` to `value`.
    #[must_use]
    pub fn sets(mut self, property: &'static str, value: impl Into<PropertyValue>) -> Self {
        self.effects.push((property, value.into()));
        self
    }

    #[must_use]
    pub fn delayed(mut self, delay: DelayPolicy) -> Self {
        self.delay = delay;
        self
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn effects(&self) -> &[(&'static str, PropertyValue)] {
        &self.effects
    }

    pub fn delay(&self) -> DelayPolicy {
        self.delay
    }
}

/// Complete description of a device category.
#[derive(Debug, Clone)]
pub struct CategorySchema {
    name: &'static str,
    exclusive_use: ExclusiveUse,
    capabilities: Capabilities,
    properties: Vec<PropertySpec>,
    operations: Vec<OperationSpec>,
    statuses: Vec<StatusRule>,
    idle_status: Option<i32>,
}

impl CategorySchema {
    /// Start describing category `name`.
    pub fn builder(name: &'static str) -> CategorySchemaBuilder {
        CategorySchemaBuilder {
            schema: Self {
                name,
                exclusive_use: ExclusiveUse::Yes,
                capabilities: Capabilities::default(),
                properties: Vec::new(),
                operations: Vec::new(),
                statuses: Vec::new(),
                idle_status: None,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn exclusive_use(&self) -> ExclusiveUse {
        self.exclusive_use
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn operation(&self, name: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|o| o.name == name)
    }

    pub fn operations(&self) -> &[OperationSpec] {
        &self.operations
    }

    pub fn status_rule(&self, status: i32) -> Option<&StatusRule> {
        self.statuses.iter().find(|s| s.status == status)
    }

    /// Status fired when the last request completes and `FlagWhenIdle` is set.
    pub fn idle_status(&self) -> Option<i32> {
        self.idle_status
    }
}

/// Builder for [`CategorySchema`].
#[derive(Debug)]
pub struct CategorySchemaBuilder {
    schema: CategorySchema,
}

impl CategorySchemaBuilder {
    #[must_use]
    pub fn exclusive_use(mut self, exclusive_use: ExclusiveUse) -> Self {
        self.schema.exclusive_use = exclusive_use;
        self
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.schema.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn property(mut self, property: PropertySpec) -> Self {
        self.schema.properties.push(property);
        self
    }

    #[must_use]
    pub fn operation(mut self, operation: OperationSpec) -> Self {
        self.schema.operations.push(operation);
        self
    }

    #[must_use]
    pub fn status(mut self, rule: StatusRule) -> Self {
        self.schema.statuses.push(rule);
        self
    }

    #[must_use]
    pub fn idle_status(mut self, status: i32) -> Self {
        self.schema.idle_status = Some(status);
        self
    }

    /// Finish the schema.
    ///
    /// # Errors
    ///
    /// Returns `IllegalArgument` if a name is declared twice, or if a status
    /// rule, a capability gate or a delay refers to an unknown property or
    /// to one of the wrong type.
    pub fn build(self) -> Result<CategorySchema> {
        let schema = self.schema;

        let mut names = HashSet::new();
        for property in &schema.properties {
            if !names.insert(property.name) {
                return Err(DeviceError::illegal_argument(format!(
                    "{}: property {} declared twice",
                    schema.name, property.name
                )));
            }
        }
        let mut names = HashSet::new();
        for operation in &schema.operations {
            if !names.insert(operation.name) {
                return Err(DeviceError::illegal_argument(format!(
                    "{}: operation {} declared twice",
                    schema.name, operation.name
                )));
            }
        }

        let expect = |name: &str, kind: ValueKind| -> Result<()> {
            match schema.property(name) {
                Some(spec) if spec.kind() == kind => Ok(()),
                Some(spec) => Err(DeviceError::illegal_argument(format!(
                    "{}: property {name} is {}, not {kind}",
                    schema.name,
                    spec.kind()
                ))),
                None => Err(DeviceError::illegal_argument(format!(
                    "{}: unknown property {name}",
                    schema.name
                ))),
            }
        };

        for property in &schema.properties {
            if let Some(capability) = property.capability {
                expect(capability, ValueKind::Bool)?;
            }
        }
        for operation in &schema.operations {
            if let Some(capability) = operation.capability {
                expect(capability, ValueKind::Bool)?;
            }
        }
        for rule in &schema.statuses {
            for (name, value) in &rule.effects {
                expect(name, value.kind())?;
            }
            if let DelayPolicy::AfterProperty(name) = rule.delay {
                expect(name, ValueKind::Int)?;
            }
        }

        Ok(schema)
    }
}
