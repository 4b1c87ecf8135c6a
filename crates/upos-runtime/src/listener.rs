//! Application side of event delivery.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use upos_core::ErrorResponse;

use crate::event::{ErrorEvent, Event};
use crate::properties::PropertyChange;

/// Receives the events of one open handle.
///
/// Callbacks run on the handle's firing task, one at a time and in
/// generation order. They must not block for long.
pub trait EventListener: Send + Sync {
    /// Status, data, output complete and direct I/O events.
    fn on_event(&self, source: &str, event: &Event);

    /// Error events. The returned response decides what happens to the
    /// failed request; responses that do not fit the error locus are
    /// replaced by the locus default.
    fn on_error(&self, source: &str, event: &ErrorEvent) -> ErrorResponse {
        let _ = source;
        event.locus.default_response()
    }

    /// A property changed.
    fn on_property_changed(&self, source: &str, change: &PropertyChange) {
        let _ = (source, change);
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl EventListener for NullListener {
    fn on_event(&self, _source: &str, _event: &Event) {}
}

/// One event as seen by a [`RecordingListener`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub event: Event,
}

/// Listener that keeps everything it receives.
///
/// Used by the CLI and by tests. Error events are answered with a fixed
/// response, `Clear` unless configured otherwise.
///
/// # Examples
///
/// ```
/// use upos_core::ErrorResponse;
/// use upos_runtime::RecordingListener;
///
/// let listener = RecordingListener::with_response(ErrorResponse::Retry);
/// assert!(listener.events().is_empty());
/// ```
#[derive(Debug)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
    changes: Mutex<Vec<(String, PropertyChange)>>,
    response: Mutex<ErrorResponse>,
    arrived: Notify,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::with_response(ErrorResponse::Clear)
    }

    pub fn with_response(response: ErrorResponse) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            changes: Mutex::new(Vec::new()),
            response: Mutex::new(response),
            arrived: Notify::new(),
        }
    }

    fn events_lock(&self) -> MutexGuard<'_, Vec<RecordedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changes_lock(&self) -> MutexGuard<'_, Vec<(String, PropertyChange)>> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the response given to later error events.
    pub fn set_response(&self, response: ErrorResponse) {
        *self.response.lock().unwrap_or_else(PoisonError::into_inner) = response;
    }

    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events_lock().clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events_lock().iter().map(|r| r.event.clone()).collect()
    }

    /// Status codes of the recorded status events, in order.
    pub fn statuses(&self) -> Vec<i32> {
        self.events_lock()
            .iter()
            .filter_map(|r| match &r.event {
                Event::Status(update) => Some(update.status),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.events_lock()
            .iter()
            .filter_map(|r| match &r.event {
                Event::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn changes(&self) -> Vec<PropertyChange> {
        self.changes_lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn clear(&self) {
        self.events_lock().clear();
        self.changes_lock().clear();
    }

    /// Wait until at least `count` events have been recorded.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();
            if self.events_lock().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return self.events_lock().len() >= count;
            }
        }
    }

    fn record(&self, source: &str, event: Event) {
        self.events_lock().push(RecordedEvent {
            received_at: Utc::now(),
            source: source.to_string(),
            event,
        });
        self.arrived.notify_waiters();
    }
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, source: &str, event: &Event) {
        self.record(source, event.clone());
    }

    fn on_error(&self, source: &str, event: &ErrorEvent) -> ErrorResponse {
        self.record(source, Event::Error(event.clone()));
        *self.response.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_property_changed(&self, source: &str, change: &PropertyChange) {
        self.changes_lock()
            .push((source.to_string(), change.clone()));
    }
}
