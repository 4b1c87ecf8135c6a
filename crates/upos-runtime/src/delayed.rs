//! Status updates whose effect only becomes visible after a delay.
//!
//! A motion sensor reports "absent" as soon as nothing moves, but the
//! application should only see it once the configured timeout passed without
//! a new "present". The delayed status is buffered per property set; a newer
//! delayed status supersedes it, a cancelling status drops it.

use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;
use upos_core::WaitTimeout;

use crate::event::StatusUpdate;
use crate::properties::PropertySet;
use crate::sync::SyncObject;

/// How a status code is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    /// Deliver at once.
    Immediate,
    /// Deliver after a fixed number of milliseconds unless superseded.
    After(u64),
    /// Deliver after as many milliseconds as integer property `name` holds.
    /// A value of zero or less delivers at once.
    AfterProperty(&'static str),
    /// If a delayed status is buffered, drop it together with this one and
    /// only apply this one's property effects. Otherwise deliver at once.
    CancelOnly,
    /// Drop any buffered status and deliver this one.
    CancelFire,
}

/// A delayed status waiting for its timer.
#[derive(Debug)]
pub(crate) struct BufferedStatus {
    status: i32,
    canceller: Arc<SyncObject>,
}

impl PropertySet {
    fn delayed_slot(&self) -> MutexGuard<'_, Option<BufferedStatus>> {
        self.delayed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route `status` through its delay policy.
    pub(crate) fn post_status(self: &Arc<Self>, status: i32) {
        let policy = self
            .schema()
            .status_rule(status)
            .map(|rule| rule.delay())
            .unwrap_or(DelayPolicy::Immediate);

        match policy {
            DelayPolicy::Immediate => self.deliver_status(status),
            DelayPolicy::CancelFire => {
                self.cancel_delayed();
                self.deliver_status(status);
            }
            DelayPolicy::CancelOnly => {
                if self.cancel_delayed() {
                    debug!(
                        "{}: status {} cancels buffered status",
                        self.logical_name(),
                        status
                    );
                    let schema = self.schema_arc();
                    self.update(|state| StatusUpdate::new(status).set_and_check(state, &schema));
                } else {
                    self.deliver_status(status);
                }
            }
            DelayPolicy::After(millis) => self.buffer_status(status, millis),
            DelayPolicy::AfterProperty(name) => {
                let millis = self.snapshot(|state| state.int(name)).unwrap_or(0);
                match u64::try_from(millis) {
                    Ok(millis) if millis > 0 => self.buffer_status(status, millis),
                    _ => self.deliver_status(status),
                }
            }
        }
    }

    /// Drop the buffered status, if any. Returns whether one was dropped.
    pub(crate) fn cancel_delayed(&self) -> bool {
        match self.delayed_slot().take() {
            Some(buffered) => {
                buffered.canceller.signal();
                true
            }
            None => false,
        }
    }

    /// Status currently waiting for its timer.
    pub fn buffered_status(&self) -> Option<i32> {
        self.delayed_slot().as_ref().map(|b| b.status)
    }

    fn buffer_status(self: &Arc<Self>, status: i32, millis: u64) {
        let canceller = Arc::new(SyncObject::new());
        let previous = self.delayed_slot().replace(BufferedStatus {
            status,
            canceller: canceller.clone(),
        });
        if let Some(previous) = previous {
            previous.canceller.signal();
        }
        debug!(
            "{}: delay status {} by {}ms",
            self.logical_name(),
            status,
            millis
        );

        let props = self.clone();
        self.runtime.spawn(async move {
            let delay = WaitTimeout::After(Duration::from_millis(millis));
            if canceller.suspend(delay).await {
                return;
            }
            let current = {
                let mut slot = props.delayed_slot();
                match slot.as_ref() {
                    Some(buffered) if Arc::ptr_eq(&buffered.canceller, &canceller) => {
                        *slot = None;
                        true
                    }
                    _ => false,
                }
            };
            if current {
                props.deliver_status(status);
            }
        });
    }
}
