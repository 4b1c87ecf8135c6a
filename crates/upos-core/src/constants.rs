//! Numeric constants shared by every device category.
//!
//! Status update codes below 1000 are category specific and live with the
//! category schema. The codes here are the ones the runtime itself
//! understands: power reporting and firmware update progress.
//!
//! | Range | Meaning |
//! |-------|---------|
//! | `2001..=2004` | power state transitions |
//! | `2100..=2200` | firmware update progress (percent above 2100) |
//! | `2200..=2205` | firmware update results |

/// Sentinel for an unbounded wait in millisecond based APIs.
pub const FOREVER: i64 = -1;

/// Service version reported when a category does not override it
/// (major 1, minor 16, build 0).
pub const DEFAULT_SERVICE_VERSION: u32 = 1_016_000;

/// Largest output id before the counter wraps back to 1.
pub const MAX_OUTPUT_ID: i32 = i32::MAX;

// ============================================================================
// Power status updates
// ============================================================================

/// Device is powered and ready.
pub const SUE_POWER_ONLINE: i32 = 2001;

/// Device is powered off or detached.
pub const SUE_POWER_OFF: i32 = 2002;

/// Device is powered but not ready.
pub const SUE_POWER_OFFLINE: i32 = 2003;

/// Device is either off or offline and cannot tell which.
pub const SUE_POWER_OFF_OFFLINE: i32 = 2004;

// ============================================================================
// Firmware update status updates
// ============================================================================

/// Base of the firmware update progress range (`UF_PROGRESS + percent`).
pub const SUE_UF_PROGRESS: i32 = 2100;

/// Firmware update finished, device usable.
pub const SUE_UF_COMPLETE: i32 = 2200;

/// Firmware update failed, previous firmware still usable.
pub const SUE_UF_FAILED_DEV_OK: i32 = 2201;

/// Firmware update failed, device unusable.
pub const SUE_UF_FAILED_DEV_UNRECOVERABLE: i32 = 2202;

/// Firmware update failed, device needs a new update.
pub const SUE_UF_FAILED_DEV_NEEDS_FIRMWARE: i32 = 2203;

/// Firmware update failed, device state unknown.
pub const SUE_UF_FAILED_DEV_UNKNOWN: i32 = 2204;

/// Firmware update finished, but the device was reset to defaults.
pub const SUE_UF_COMPLETE_DEV_NOT_RESTORED: i32 = 2205;

/// Returns `true` if `status` is one of the power reporting codes.
#[must_use]
pub fn is_power_status(status: i32) -> bool {
    (SUE_POWER_ONLINE..=SUE_POWER_OFF_OFFLINE).contains(&status)
}

/// Returns `true` if `status` is a firmware update progress or result code.
#[must_use]
pub fn is_firmware_status(status: i32) -> bool {
    (SUE_UF_PROGRESS + 1..=SUE_UF_COMPLETE_DEV_NOT_RESTORED).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_status_range() {
        assert!(is_power_status(SUE_POWER_ONLINE));
        assert!(is_power_status(SUE_POWER_OFF_OFFLINE));
        assert!(!is_power_status(SUE_UF_COMPLETE));
        assert!(!is_power_status(1));
    }

    #[test]
    fn test_firmware_status_range() {
        assert!(is_firmware_status(SUE_UF_PROGRESS + 50));
        assert!(is_firmware_status(SUE_UF_COMPLETE));
        assert!(is_firmware_status(SUE_UF_COMPLETE_DEV_NOT_RESTORED));
        assert!(!is_firmware_status(SUE_UF_PROGRESS));
        assert!(!is_firmware_status(SUE_POWER_ONLINE));
    }
}
