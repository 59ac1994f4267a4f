//! Value rules shared by config validation and the runtime builders.

/// Slack allowed on `day + night <= 1` for fractions typed as decimals.
pub const SPLIT_TOLERANCE: f32 = 1e-6;

/// Largest supported distance of local time from UTC.
pub const MAX_UTC_OFFSET_SECS: u32 = 14 * 3600;

#[inline]
pub fn positive_finite(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

#[inline]
pub fn fraction(v: f32) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

/// Two fractions whose sum stays within 1 (up to [`SPLIT_TOLERANCE`]).
#[inline]
pub fn split_ok(day: f32, night: f32) -> bool {
    fraction(day) && fraction(night) && day + night <= 1.0 + SPLIT_TOLERANCE
}

/// The dose cadence must tile the hour.
#[inline]
pub fn doses_per_hour_ok(n: u32) -> bool {
    n != 0 && 60 % n == 0
}

/// `[start, end)` with `start <= 23` and `start < end <= 24`.
#[inline]
pub fn day_window_ok(start: u8, end: u8) -> bool {
    start <= 23 && end <= 24 && start < end
}

#[inline]
pub fn utc_offset_ok(offset_secs: i64) -> bool {
    offset_secs.unsigned_abs() <= u64::from(MAX_UTC_OFFSET_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.7, 0.3, true)]
    #[case(0.6, 0.2, true)]
    #[case(0.1, 0.2, true)]
    #[case(0.8, 0.4, false)]
    #[case(-0.1, 0.5, false)]
    #[case(f32::NAN, 0.0, false)]
    fn split_rule(#[case] day: f32, #[case] night: f32, #[case] ok: bool) {
        assert_eq!(split_ok(day, night), ok);
    }

    #[rstest]
    #[case(11, 23, true)]
    #[case(0, 24, true)]
    #[case(23, 24, true)]
    #[case(11, 11, false)]
    #[case(12, 11, false)]
    #[case(0, 25, false)]
    fn window_rule(#[case] start: u8, #[case] end: u8, #[case] ok: bool) {
        assert_eq!(day_window_ok(start, end), ok);
    }

    #[test]
    fn cadence_and_offset_rules() {
        assert!(doses_per_hour_ok(2) && doses_per_hour_ok(60));
        assert!(!doses_per_hour_ok(0) && !doses_per_hour_ok(7));
        assert!(utc_offset_ok(-14 * 3600) && !utc_offset_ok(14 * 3600 + 60));
    }
}
