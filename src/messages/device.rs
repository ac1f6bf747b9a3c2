//! Device id constants.

use std::ops::RangeInclusive;

pub const PRIMARY_ID: u8 = 1;

/// Exclusive upper bound on device ids.
pub const MAXIMUM_DEVICE_ID: u8 = 127;

/// Every device id an account can have, `PRIMARY_ID..MAXIMUM_DEVICE_ID`.
pub fn all_possible_device_ids() -> RangeInclusive<u8> {
    PRIMARY_ID..=MAXIMUM_DEVICE_ID - 1
}
