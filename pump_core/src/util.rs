//! Common time helpers for pump_core.
//!
//! Wall-clock values are `u32` epoch seconds (UTC). Calendar decisions are
//! made on the *local* date, obtained by applying a fixed UTC offset.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc};

/// Number of seconds in one day.
pub const SECS_PER_DAY: i64 = 86_400;

/// Out-of-range offsets are rejected by config validation; UTC otherwise.
#[inline]
fn offset(utc_offset_secs: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_secs).unwrap_or_else(|| Utc.fix())
}

/// Local date-time of `epoch_secs` at the given offset.
pub fn local_datetime(epoch_secs: u32, utc_offset_secs: i32) -> DateTime<FixedOffset> {
    let utc = DateTime::from_timestamp(i64::from(epoch_secs), 0).unwrap_or_default();
    utc.with_timezone(&offset(utc_offset_secs))
}

/// Local calendar date of `epoch_secs`.
pub fn local_date(epoch_secs: u32, utc_offset_secs: i32) -> NaiveDate {
    local_datetime(epoch_secs, utc_offset_secs).date_naive()
}

/// `(year, ordinal)` of the local date; two instants fall on the same calendar
/// day exactly when these match.
pub fn day_key(epoch_secs: u32, utc_offset_secs: i32) -> (i32, u32) {
    let d = local_date(epoch_secs, utc_offset_secs);
    (d.year(), d.ordinal())
}

#[inline]
pub fn same_local_day(a: u32, b: u32, utc_offset_secs: i32) -> bool {
    day_key(a, utc_offset_secs) == day_key(b, utc_offset_secs)
}

/// Local hour (0..=23).
pub fn local_hour(epoch_secs: u32, utc_offset_secs: i32) -> u8 {
    // hour() is always < 24
    local_datetime(epoch_secs, utc_offset_secs).hour() as u8
}

/// Local `HH:MM`.
pub fn local_hhmm(epoch_secs: u32, utc_offset_secs: i32) -> String {
    local_datetime(epoch_secs, utc_offset_secs)
        .format("%H:%M")
        .to_string()
}

/// Local seconds since the epoch (UTC seconds shifted by the offset).
#[inline]
pub fn to_local_secs(epoch_secs: u32, utc_offset_secs: i32) -> i64 {
    i64::from(epoch_secs) + i64::from(utc_offset_secs)
}

/// Inverse of [`to_local_secs`], saturating into the `u32` range.
#[inline]
pub fn from_local_secs(local_secs: i64, utc_offset_secs: i32) -> u32 {
    let utc = local_secs - i64::from(utc_offset_secs);
    u32::try_from(utc.max(0)).unwrap_or(u32::MAX)
}

/// Epoch seconds of the next local midnight strictly after `epoch_secs`.
pub fn next_local_midnight(epoch_secs: u32, utc_offset_secs: i32) -> u32 {
    let local = to_local_secs(epoch_secs, utc_offset_secs);
    let midnight = (local.div_euclid(SECS_PER_DAY) + 1) * SECS_PER_DAY;
    from_local_secs(midnight, utc_offset_secs)
}
