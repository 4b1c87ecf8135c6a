//! Queued units of device work.
//!
//! A [`Request`] is created once a call passed validation. It carries an
//! immutable snapshot of the call's parameters, an abort flag the driver
//! polls at its own checkpoints, and a completion cell any number of callers
//! can wait on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use upos_core::{DeviceError, PropertyValue, Result, WaitTimeout};

use crate::properties::{PropertySet, SessionId};

/// Output requests produce `OutputComplete` events, input requests deliver
/// data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Output,
    Input,
}

/// Named parameters of one operation call.
///
/// # Examples
///
/// ```
/// use upos_runtime::Params;
///
/// let params = Params::new()
///     .with("NumberOfCycles", 3)
///     .with("InterSoundWait", 250);
///
/// assert_eq!(params.int("NumberOfCycles"), Some(3));
/// assert_eq!(params.int("Missing"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, PropertyValue)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<PropertyValue>) {
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(PropertyValue::as_int)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PropertyValue::as_bool)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropertyValue::as_text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    Failed(DeviceError),
    Aborted,
}

/// One validated operation call.
#[derive(Debug)]
pub(crate) struct Request {
    id: u64,
    kind: RequestKind,
    operation: &'static str,
    params: Params,
    property_set: Arc<PropertySet>,
    output_id: AtomicI32,
    synchronous: bool,
    concurrent: bool,
    aborted: AtomicBool,
    no_events: AtomicBool,
    abort_notify: Notify,
    outcome: watch::Sender<Option<RequestOutcome>>,
}

impl Request {
    pub(crate) fn new(
        id: u64,
        kind: RequestKind,
        operation: &'static str,
        params: Params,
        property_set: Arc<PropertySet>,
        synchronous: bool,
        concurrent: bool,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            kind,
            operation,
            params,
            property_set,
            output_id: AtomicI32::new(0),
            synchronous,
            concurrent,
            aborted: AtomicBool::new(false),
            no_events: AtomicBool::new(false),
            abort_notify: Notify::new(),
            outcome,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> RequestKind {
        self.kind
    }

    pub(crate) fn operation(&self) -> &'static str {
        self.operation
    }

    pub(crate) fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn property_set(&self) -> &Arc<PropertySet> {
        &self.property_set
    }

    pub(crate) fn session(&self) -> SessionId {
        self.property_set.session()
    }

    pub(crate) fn output_id(&self) -> i32 {
        self.output_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_output_id(&self, id: i32) {
        self.output_id.store(id, Ordering::Release);
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub(crate) fn is_concurrent(&self) -> bool {
        self.concurrent && !self.synchronous
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn no_events(&self) -> bool {
        self.no_events.load(Ordering::Acquire)
    }

    /// Mark the request aborted and wake its checkpoint. Returns at once.
    pub(crate) fn abort(&self, no_events: bool) {
        if no_events {
            self.no_events.store(true, Ordering::Release);
        }
        self.aborted.store(true, Ordering::Release);
        self.abort_notify.notify_waiters();
    }

    /// Abort and wait until the operation body has unwound.
    pub(crate) async fn abort_and_wait(&self, no_events: bool) {
        self.abort(no_events);
        self.wait(WaitTimeout::Forever).await;
    }

    pub(crate) fn finish(&self, outcome: RequestOutcome) {
        self.outcome.send_replace(Some(outcome));
    }

    pub(crate) fn outcome(&self) -> Option<RequestOutcome> {
        self.outcome.borrow().clone()
    }

    /// Prepare a suspended request for another run.
    pub(crate) fn reset(&self) {
        self.aborted.store(false, Ordering::Release);
        self.no_events.store(false, Ordering::Release);
        self.outcome.send_replace(None);
    }

    pub(crate) async fn wait(&self, timeout: WaitTimeout) -> Option<RequestOutcome> {
        let mut receiver = self.outcome.subscribe();
        let finished = receiver.wait_for(Option::is_some);
        match timeout {
            WaitTimeout::Forever => finished.await.ok().and_then(|o| o.clone()),
            WaitTimeout::After(duration) => match tokio::time::timeout(duration, finished).await {
                Ok(Ok(outcome)) => outcome.clone(),
                _ => None,
            },
        }
    }
}

/// What a driver sees while it executes a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request: Arc<Request>,
}

impl RequestContext {
    pub(crate) fn new(request: Arc<Request>) -> Self {
        Self { request }
    }

    /// Operation name as declared in the category schema.
    pub fn operation(&self) -> &'static str {
        self.request.operation()
    }

    pub fn kind(&self) -> RequestKind {
        self.request.kind()
    }

    /// Parameters exactly as the caller passed them.
    pub fn params(&self) -> &Params {
        self.request.params()
    }

    pub fn property_set(&self) -> &Arc<PropertySet> {
        self.request.property_set()
    }

    pub fn output_id(&self) -> i32 {
        self.request.output_id()
    }

    pub fn is_synchronous(&self) -> bool {
        self.request.is_synchronous()
    }

    pub fn is_aborted(&self) -> bool {
        self.request.is_aborted()
    }

    /// Cooperative checkpoint.
    ///
    /// # Errors
    ///
    /// Fails once the request has been aborted.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_aborted() {
            Err(DeviceError::aborted(self.operation()))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless aborted first.
    ///
    /// Returns `false` if the request was aborted before or during the sleep.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let aborted = self.request.abort_notify.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();
        if self.is_aborted() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = aborted => false,
        }
    }
}

/// Caller side of an asynchronous request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    request: Arc<Request>,
}

impl RequestHandle {
    pub(crate) fn new(request: Arc<Request>) -> Self {
        Self { request }
    }

    pub fn id(&self) -> u64 {
        self.request.id()
    }

    pub fn operation(&self) -> &'static str {
        self.request.operation()
    }

    /// `OutputID` assigned at enqueue time, 0 for input requests.
    pub fn output_id(&self) -> i32 {
        self.request.output_id()
    }

    /// Ask the driver to stop at its next checkpoint.
    pub fn abort(&self) {
        self.request.abort(false);
    }

    pub fn outcome(&self) -> Option<RequestOutcome> {
        self.request.outcome()
    }

    /// Wait for the request to end. Returns `None` on timeout; the request
    /// itself keeps running.
    pub async fn wait(&self, timeout: WaitTimeout) -> Option<RequestOutcome> {
        self.request.wait(timeout).await
    }
}
