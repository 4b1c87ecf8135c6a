//! Signal/wait primitive.
//!
//! [`SyncObject`] is a counting semaphore with no initial permits: every
//! [`signal`](SyncObject::signal) releases exactly one
//! [`suspend`](SyncObject::suspend), and a signal issued before anybody waits
//! is kept until the next suspend consumes it.

use tokio::sync::Semaphore;
use upos_core::WaitTimeout;

/// Blocks a caller until signalled or until a timeout elapses.
///
/// # Examples
///
/// ```
/// use upos_core::WaitTimeout;
/// use upos_runtime::SyncObject;
///
/// #[tokio::main]
/// async fn main() {
///     let sync = SyncObject::new();
///
///     // Nothing signalled yet: a zero timeout returns at once
///     assert!(!sync.suspend(WaitTimeout::immediate()).await);
///
///     sync.signal();
///     assert!(sync.suspend(WaitTimeout::Forever).await);
/// }
/// ```
#[derive(Debug)]
pub struct SyncObject {
    semaphore: Semaphore,
}

impl SyncObject {
    /// Create an unsignalled object.
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(0),
        }
    }

    /// Release one waiter, or the next suspend if nobody waits yet.
    pub fn signal(&self) {
        self.semaphore.add_permits(1);
    }

    /// Wait for a signal.
    ///
    /// Returns `true` if a signal was consumed and `false` if the timeout
    /// elapsed first. `WaitTimeout::After(Duration::ZERO)` never waits.
    pub async fn suspend(&self, timeout: WaitTimeout) -> bool {
        match timeout {
            WaitTimeout::Forever => match self.semaphore.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
            WaitTimeout::After(duration) if duration.is_zero() => self.try_take(),
            WaitTimeout::After(duration) => {
                match tokio::time::timeout(duration, self.semaphore.acquire()).await {
                    Ok(Ok(permit)) => {
                        permit.forget();
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// Consume a pending signal without waiting.
    pub fn try_take(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Drop all pending signals.
    pub fn drain(&self) {
        while self.try_take() {}
    }
}

impl Default for SyncObject {
    fn default() -> Self {
        Self::new()
    }
}
