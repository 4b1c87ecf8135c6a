//! Plumbing shared by the simulated drivers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;
use upos_core::{DeviceError, Result};
use upos_runtime::{DataEvent, EventSink};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event sink slot and scripted failures of one simulated device.
#[derive(Debug, Default)]
pub(crate) struct SimCore {
    sink: Mutex<Option<EventSink>>,
    failures: Mutex<VecDeque<DeviceError>>,
}

impl SimCore {
    pub(crate) fn attach(&self, sink: EventSink) {
        *lock(&self.sink) = Some(sink);
    }

    fn sink(&self) -> Option<EventSink> {
        lock(&self.sink).clone().filter(EventSink::is_attached)
    }

    /// Report a status change. Returns `false` if no handle is open.
    pub(crate) fn status(&self, status: i32) -> bool {
        match self.sink() {
            Some(sink) => {
                sink.status(status);
                true
            }
            None => {
                warn!("Status {} dropped: device not open", status);
                false
            }
        }
    }

    pub(crate) fn data(&self, event: DataEvent) -> bool {
        match self.sink() {
            Some(sink) => {
                sink.data(event);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_next(&self, error: DeviceError) {
        lock(&self.failures).push_back(error);
    }

    /// Pop the next scripted failure, if any.
    pub(crate) fn take_failure(&self) -> Result<()> {
        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
