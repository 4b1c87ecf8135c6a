//! Claim ownership and the state guards every operation runs first.
//!
//! A physical device has one [`ClaimTable`]: at most one handle owns the
//! claim, others wait in FIFO order. The guard functions take the handle's
//! [`PropertyState`] plus the current claimer (read from the table *before*
//! the property lock is taken, so the device-level lock never nests inside a
//! property lock).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::debug;
use upos_core::{ControlState, DeviceError, ExclusiveUse, Result, WaitTimeout};

use crate::properties::{PropertyState, SessionId};
use crate::schema::Precondition;
use crate::sync::SyncObject;

#[derive(Debug, Default)]
struct ClaimSlot {
    claimer: Option<SessionId>,
    waiters: VecDeque<Arc<SyncObject>>,
}

/// Claim ownership of one physical device.
#[derive(Debug, Default)]
pub struct ClaimTable {
    slot: Mutex<ClaimSlot>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClaimSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session currently holding the claim.
    pub fn claimer(&self) -> Option<SessionId> {
        self.lock().claimer
    }

    /// Take the claim for `session`.
    ///
    /// Waits while another session holds the claim. A zero timeout never
    /// waits and fails with `IllegalState`/`E_CLAIMED`; a positive timeout
    /// that elapses fails with `Timeout`.
    ///
    /// # Errors
    ///
    /// Also fails with `E_CLAIMED` if `session` already holds the claim.
    pub async fn claim(&self, session: SessionId, timeout: WaitTimeout) -> Result<()> {
        let deadline = match timeout {
            WaitTimeout::After(duration) => Some(Instant::now() + duration),
            WaitTimeout::Forever => None,
        };

        loop {
            let waiter = {
                let mut slot = self.lock();
                match slot.claimer {
                    None => {
                        slot.claimer = Some(session);
                        return Ok(());
                    }
                    Some(claimer) if claimer == session => {
                        return Err(DeviceError::claimed("Device just claimed"));
                    }
                    Some(_) if timeout.is_immediate() => {
                        return Err(DeviceError::claimed("Device claimed by other instance"));
                    }
                    Some(claimer) => {
                        debug!("Session {} waits for claim held by {}", session, claimer);
                        let waiter = Arc::new(SyncObject::new());
                        slot.waiters.push_back(waiter.clone());
                        waiter
                    }
                }
            };

            let remaining = match deadline {
                None => WaitTimeout::Forever,
                Some(deadline) => {
                    WaitTimeout::After(deadline.saturating_duration_since(Instant::now()))
                }
            };
            if waiter.suspend(remaining).await {
                continue;
            }

            let mut slot = self.lock();
            slot.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
            if slot.claimer.is_none() {
                slot.claimer = Some(session);
                return Ok(());
            }
            return Err(DeviceError::timeout(timeout.as_millis(), "Claim timed out"));
        }
    }

    /// Give up the claim held by `session` and wake the next waiter.
    ///
    /// Returns `false` if `session` did not hold the claim.
    pub fn release(&self, session: SessionId) -> bool {
        let mut slot = self.lock();
        if slot.claimer != Some(session) {
            return false;
        }
        slot.claimer = None;
        if let Some(waiter) = slot.waiters.pop_front() {
            waiter.signal();
        }
        true
    }
}

/// The handle is open.
pub fn check_opened(state: &PropertyState) -> Result<()> {
    if state.state() == ControlState::Closed {
        return Err(DeviceError::closed("Device not opened"));
    }
    Ok(())
}

/// The handle is open and has enabled the device at least once.
pub fn check_first_enabled(state: &PropertyState) -> Result<()> {
    check_opened(state)?;
    if !state.first_enable_happened() {
        return Err(DeviceError::illegal_state("Device never enabled"));
    }
    Ok(())
}

/// Exclusive devices must be claimed by this handle.
pub fn check_claimed(state: &PropertyState, claimer: Option<SessionId>) -> Result<()> {
    check_opened(state)?;
    if state.exclusive_use() == ExclusiveUse::Yes {
        match claimer {
            None => return Err(DeviceError::not_claimed("Device not claimed")),
            Some(other) if other != state.session() => {
                return Err(DeviceError::claimed("Device claimed by other instance"));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Claimed where required and enabled.
pub fn check_enabled(state: &PropertyState, claimer: Option<SessionId>) -> Result<()> {
    check_claimed(state, claimer)?;
    if !state.device_enabled() {
        return Err(DeviceError::disabled("Device not enabled"));
    }
    Ok(())
}

/// Enabled, and no other handle holds the claim.
pub fn check_enabled_unclaimed(state: &PropertyState, claimer: Option<SessionId>) -> Result<()> {
    check_enabled(state, claimer)?;
    if let Some(other) = claimer
        && other != state.session()
    {
        return Err(DeviceError::claimed("Device claimed by other instance"));
    }
    Ok(())
}

/// Enabled and not busy.
pub fn check_busy(state: &PropertyState, claimer: Option<SessionId>) -> Result<()> {
    check_enabled(state, claimer)?;
    if state.state() == ControlState::Busy {
        return Err(DeviceError::busy("Device is busy"));
    }
    Ok(())
}

/// Run the guard matching `precondition`.
pub fn check(
    precondition: Precondition,
    state: &PropertyState,
    claimer: Option<SessionId>,
) -> Result<()> {
    match precondition {
        Precondition::Opened => check_opened(state),
        Precondition::FirstEnabled => check_first_enabled(state),
        Precondition::Claimed => check_claimed(state, claimer),
        Precondition::Enabled => check_enabled(state, claimer),
        Precondition::EnabledUnclaimed => check_enabled_unclaimed(state, claimer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CategorySchema;
    use rstest::rstest;
    use std::time::Duration;
    use upos_core::{ErrorCode, ErrorKind};

    fn state(session: SessionId, exclusive_use: ExclusiveUse) -> PropertyState {
        let schema = CategorySchema::builder("Test")
            .exclusive_use(exclusive_use)
            .build()
            .unwrap();
        PropertyState::new(session, "dev", &schema)
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let table = ClaimTable::new();
        table.claim(1, WaitTimeout::immediate()).await.unwrap();
        assert_eq!(table.claimer(), Some(1));
        assert!(!table.release(2));
        assert!(table.release(1));
        assert_eq!(table.claimer(), None);
    }

    #[tokio::test]
    async fn test_claim_twice_by_same_session() {
        let table = ClaimTable::new();
        table.claim(1, WaitTimeout::Forever).await.unwrap();
        let error = table.claim(1, WaitTimeout::Forever).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::Claimed);
    }

    #[tokio::test]
    async fn test_zero_timeout_against_other_claimer() {
        let table = ClaimTable::new();
        table.claim(1, WaitTimeout::Forever).await.unwrap();
        let error = table.claim(2, WaitTimeout::immediate()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::IllegalState);
        assert_eq!(error.code(), ErrorCode::Claimed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_timeout_expires() {
        let table = ClaimTable::new();
        table.claim(1, WaitTimeout::Forever).await.unwrap();
        let error = table
            .claim(2, WaitTimeout::After(Duration::from_millis(250)))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(table.claimer(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_claim_on_release() {
        let table = Arc::new(ClaimTable::new());
        table.claim(1, WaitTimeout::Forever).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.claim(2, WaitTimeout::Forever).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        table.release(1);
        waiter.await.unwrap().unwrap();
        assert_eq!(table.claimer(), Some(2));
    }

    #[test]
    fn test_closed_handle_fails_every_guard() {
        let mut closed = state(1, ExclusiveUse::Yes);
        closed.set_state(ControlState::Closed);
        for precondition in [
            Precondition::Opened,
            Precondition::FirstEnabled,
            Precondition::Claimed,
            Precondition::Enabled,
            Precondition::EnabledUnclaimed,
        ] {
            let error = check(precondition, &closed, Some(1)).unwrap_err();
            assert_eq!(error.code(), ErrorCode::Closed);
        }
    }

    #[rstest]
    #[case(ExclusiveUse::Yes, None, Some(ErrorCode::NotClaimed))]
    #[case(ExclusiveUse::Yes, Some(2), Some(ErrorCode::Claimed))]
    #[case(ExclusiveUse::Yes, Some(1), None)]
    #[case(ExclusiveUse::Allowed, None, None)]
    #[case(ExclusiveUse::Allowed, Some(2), None)]
    #[case(ExclusiveUse::No, None, None)]
    fn test_check_claimed(
        #[case] exclusive_use: ExclusiveUse,
        #[case] claimer: Option<SessionId>,
        #[case] expected: Option<ErrorCode>,
    ) {
        let state = state(1, exclusive_use);
        assert_eq!(check_claimed(&state, claimer).err().map(|e| e.code()), expected);
    }

    #[test]
    fn test_check_enabled_unclaimed_allowed_policy() {
        let mut state = state(1, ExclusiveUse::Allowed);
        state.set_device_enabled(true);
        assert!(check_enabled_unclaimed(&state, None).is_ok());
        assert!(check_enabled_unclaimed(&state, Some(1)).is_ok());
        assert_eq!(
            check_enabled_unclaimed(&state, Some(2)).unwrap_err().code(),
            ErrorCode::Claimed
        );
    }

    #[test]
    fn test_check_enabled_and_busy() {
        let mut state = state(1, ExclusiveUse::No);
        assert_eq!(
            check_enabled(&state, None).unwrap_err().code(),
            ErrorCode::Disabled
        );
        state.set_device_enabled(true);
        assert!(check_busy(&state, None).is_ok());
        state.set_state(ControlState::Busy);
        assert_eq!(check_busy(&state, None).unwrap_err().code(), ErrorCode::Busy);
    }

    #[test]
    fn test_check_first_enabled() {
        let mut state = state(1, ExclusiveUse::No);
        assert_eq!(
            check_first_enabled(&state).unwrap_err().code(),
            ErrorCode::Illegal
        );
        state.set_device_enabled(true);
        state.set_device_enabled(false);
        assert!(check_first_enabled(&state).is_ok());
    }
}
