//! Weighted per-slot daily timetable.
//!
//! The table is advisory: it is shown to the user and exported by the CLI, but
//! live dosing decisions come from [`AutoDoser`](crate::scheduler::AutoDoser).

use tracing::warn;

use crate::error::ScheduleError;

pub const MINUTES_PER_DAY: u32 = 1440;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoseScheduleEntry {
    pub hour: u8,
    pub minute: u8,
    pub volume_ml: f32,
}

impl DoseScheduleEntry {
    #[inline]
    pub fn in_window(&self, start_hour: u8, end_hour: u8) -> bool {
        in_window(self.hour, start_hour, end_hour)
    }
}

impl core::fmt::Display for DoseScheduleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02}:{:02} {:.2} mL", self.hour, self.minute, self.volume_ml)
    }
}

/// Hour in `[start, end)`.
#[inline]
pub fn in_window(hour: u8, start_hour: u8, end_hour: u8) -> bool {
    hour >= start_hour && hour < end_hour
}

/// Spread `total_ml` over `slots` evenly spaced times of day.
///
/// Slots whose hour lies in `[start_hour, end_hour)` share
/// `total_ml * pct_in`; the others share `total_ml * pct_out`. A pool without
/// slots gets nothing. Slot counts that do not divide 1440 use the floored
/// interval and leave the tail of the day empty.
pub fn generate_weighted_schedule(
    slots: u32,
    total_ml: f32,
    start_hour: u8,
    end_hour: u8,
    pct_in: f32,
    pct_out: f32,
) -> Result<Vec<DoseScheduleEntry>, ScheduleError> {
    if slots == 0 || slots > MINUTES_PER_DAY {
        return Err(ScheduleError::InvalidSlots(slots));
    }
    if !(total_ml.is_finite() && total_ml >= 0.0) {
        return Err(ScheduleError::InvalidVolume(total_ml));
    }
    let fraction_ok = |p: f32| (0.0..=1.0).contains(&p);
    if !(fraction_ok(pct_in) && fraction_ok(pct_out)) {
        return Err(ScheduleError::InvalidSplit {
            day: pct_in,
            night: pct_out,
        });
    }
    if MINUTES_PER_DAY % slots != 0 {
        warn!(
            slots,
            interval_min = MINUTES_PER_DAY / slots,
            "slot count does not divide the day; using floored interval"
        );
    }

    let interval = MINUTES_PER_DAY / slots;
    let times: Vec<(u8, u8)> = (0..slots)
        .map(|i| {
            let minutes = i * interval;
            // minutes < 1440, so both parts fit in u8
            ((minutes / 60) as u8, (minutes % 60) as u8)
        })
        .collect();

    let count_in = times
        .iter()
        .filter(|(h, _)| in_window(*h, start_hour, end_hour))
        .count();
    let count_out = times.len() - count_in;

    let per_slot = |pool: f32, count: usize| {
        if count > 0 { pool / count as f32 } else { 0.0 }
    };
    let ml_in = per_slot(total_ml * pct_in, count_in);
    let ml_out = per_slot(total_ml * pct_out, count_out);

    Ok(times
        .into_iter()
        .map(|(hour, minute)| DoseScheduleEntry {
            hour,
            minute,
            volume_ml: if in_window(hour, start_hour, end_hour) {
                ml_in
            } else {
                ml_out
            },
        })
        .collect())
}
