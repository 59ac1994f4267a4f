//! Auto-dosing scheduler (`AutoDoser`).
//!
//! Turns one daily volume into time-triggered volume moves. The live decision
//! uses a two-pool day/night cadence: every `60 / doses_per_hour` minutes a
//! dose of `pool / (doses_per_hour * 24)` is due, where the pool is the day or
//! night share depending on the local hour. A dose never pushes the ledger
//! past the daily total.
//!
//! Wall-clock inputs are `u32` epoch seconds. Calendar days are local days
//! under the configured fixed UTC offset and are compared by year *and*
//! ordinal.

use pump_config::rules;
use pump_traits::{StatusSink, StepperDriver, Store, StoreValue};
use tracing::{debug, info, warn};

use crate::config::ScheduleSettings;
use crate::error::{Result, ScheduleError};
use crate::persist::{self, keys};
use crate::pump::{PumpController, PumpMode};
use crate::schedule::{DoseScheduleEntry, generate_weighted_schedule, in_window};
use crate::util;

/// Persisted and derived scheduler state.
#[derive(Debug, Clone, PartialEq)]
pub struct DosingScheduleMeta {
    pub total_daily_volume: f32,
    pub day_volume: f32,
    pub night_volume: f32,
    pub day_start_hour: u8,
    pub day_end_hour: u8,
    /// Epoch seconds of the last successful dose; `0` means never.
    pub last_dosing_time: u32,
    /// Epoch seconds; `0` means not yet derived.
    pub next_dosing_time: u32,
    pub enabled: bool,
    pub total_dosed_volume: f32,
    pub last_dose_volume: f32,
    pub doses_day: u32,
    pub doses_night: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// The dose would push the ledger past the daily total.
    CapReached { dosed: f32, dose: f32, total: f32 },
    Uncalibrated,
    /// The dose rounds to zero motor steps.
    ZeroSteps,
}

impl core::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SkipReason::CapReached { dosed, dose, total } => write!(
                f,
                "daily cap reached ({dosed:.2} + {dose:.2} > {total:.2} mL)"
            ),
            SkipReason::Uncalibrated => f.write_str("pump not calibrated"),
            SkipReason::ZeroSteps => f.write_str("dose rounds to zero steps"),
        }
    }
}

/// What a call to [`AutoDoser::check_and_dose`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DoseOutcome {
    Disabled,
    /// Wall clock not synchronized.
    ClockInvalid,
    /// Pump moving or still in its hold delay.
    PumpBusy,
    /// Second call within the same wall-clock second.
    RateLimited,
    /// First decision after a restart; next dose time derived.
    Seeded { next: u32 },
    /// Calendar day changed; ledger reset.
    NewDay { next: u32 },
    NotDue { next: u32 },
    Dosed { volume_ml: f32, steps: i64, next: u32 },
    Skipped { reason: SkipReason, next: u32 },
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub meta: DosingScheduleMeta,
    pub remaining_daily_volume: f32,
    pub day_ratio: f32,
    pub night_ratio: f32,
    pub doses_per_hour: u32,
}

pub struct AutoDoser {
    settings: ScheduleSettings,
    meta: DosingScheduleMeta,
    table: Vec<DoseScheduleEntry>,
    /// Instant whose local date owns the current ledger.
    ledger_time: u32,
    last_check: Option<u32>,
}

impl core::fmt::Debug for AutoDoser {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AutoDoser")
            .field("enabled", &self.meta.enabled)
            .field("total_daily_volume", &self.meta.total_daily_volume)
            .field("total_dosed_volume", &self.meta.total_dosed_volume)
            .field("next_dosing_time", &self.meta.next_dosing_time)
            .finish()
    }
}

impl AutoDoser {
    pub fn new(settings: ScheduleSettings) -> Self {
        let meta = DosingScheduleMeta {
            total_daily_volume: settings.default_daily_volume,
            day_volume: 0.0,
            night_volume: 0.0,
            day_start_hour: settings.day_start_hour,
            day_end_hour: settings.day_end_hour,
            last_dosing_time: 0,
            next_dosing_time: 0,
            enabled: false,
            total_dosed_volume: 0.0,
            last_dose_volume: 0.0,
            doses_day: 0,
            doses_night: 0,
        };
        let mut doser = Self {
            settings,
            meta,
            table: Vec::new(),
            ledger_time: 0,
            last_check: None,
        };
        doser.update_schedule();
        doser
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    pub fn meta(&self) -> &DosingScheduleMeta {
        &self.meta
    }

    /// Advisory per-slot timetable for the current volume and split.
    pub fn table(&self) -> &[DoseScheduleEntry] {
        &self.table
    }

    pub fn is_enabled(&self) -> bool {
        self.meta.enabled
    }

    pub fn daily_volume(&self) -> f32 {
        self.meta.total_daily_volume
    }

    pub fn next_dosing_time(&self) -> u32 {
        self.meta.next_dosing_time
    }

    pub fn remaining_daily_volume(&self) -> f32 {
        (self.meta.total_daily_volume - self.meta.total_dosed_volume).max(0.0)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Restore the ledger. Missing keys use defaults (`enabled` = false);
    /// NaN or negative values are replaced. The next dose time is always
    /// re-derived on the first decision.
    pub fn load_state(&mut self, store: &dyn Store) {
        let default_volume = self.settings.default_daily_volume;
        self.meta.enabled = persist::load_bool(store, keys::ENABLED, false);
        self.meta.total_daily_volume = persist::load_f32(
            store,
            keys::TOTAL_DAILY_VOLUME,
            default_volume,
            default_volume,
            |v| v.is_finite() && v > 0.0,
        );
        self.meta.last_dosing_time = persist::load_u32(store, keys::LAST_DOSING_TIME, 0);
        self.meta.total_dosed_volume = persist::load_f32(
            store,
            keys::TOTAL_DOSED_VOLUME,
            0.0,
            0.0,
            persist::valid_non_negative,
        );
        let day = persist::load_f32(
            store,
            keys::DAY_PERCENT,
            self.settings.day_ratio,
            self.settings.day_ratio,
            persist::valid_non_negative,
        );
        let night = persist::load_f32(
            store,
            keys::NIGHT_PERCENT,
            self.settings.night_ratio,
            self.settings.night_ratio,
            persist::valid_non_negative,
        );
        if rules::split_ok(day, night) {
            self.settings.day_ratio = day;
            self.settings.night_ratio = night;
        } else {
            warn!(day, night, "stored split invalid; keeping configured ratios");
        }
        self.meta.next_dosing_time = 0;
        self.ledger_time = self.meta.last_dosing_time;
        self.last_check = None;
        self.update_schedule();
        info!(
            enabled = self.meta.enabled,
            daily_ml = self.meta.total_daily_volume,
            last = self.meta.last_dosing_time,
            dosed_ml = self.meta.total_dosed_volume,
            "scheduler state loaded"
        );
    }

    pub fn save_state(&self, store: &mut dyn Store) -> Result<()> {
        store.put(keys::ENABLED, StoreValue::Bool(self.meta.enabled));
        store.put(
            keys::TOTAL_DAILY_VOLUME,
            StoreValue::F32(self.meta.total_daily_volume),
        );
        store.put(
            keys::LAST_DOSING_TIME,
            StoreValue::U32(self.meta.last_dosing_time),
        );
        store.put(
            keys::TOTAL_DOSED_VOLUME,
            StoreValue::F32(self.meta.total_dosed_volume),
        );
        store.put(keys::DAY_PERCENT, StoreValue::F32(self.settings.day_ratio));
        store.put(
            keys::NIGHT_PERCENT,
            StoreValue::F32(self.settings.night_ratio),
        );
        persist::commit(store)?;
        debug!("scheduler state saved");
        Ok(())
    }

    /// Save from inside the decision path; failures are logged and retried
    /// on the next state change.
    fn persist_quietly(&self, store: &mut dyn Store) {
        if let Err(e) = self.save_state(store) {
            warn!(error = %e, "could not persist scheduler state");
        }
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    /// Enable auto-dosing. The next dose time is re-derived on the next
    /// decision; the day's ledger is kept.
    pub fn enable(&mut self, store: &mut dyn Store) -> Result<()> {
        self.meta.enabled = true;
        self.meta.next_dosing_time = 0;
        self.update_schedule();
        info!("auto dosing enabled");
        self.save_state(store)
    }

    pub fn disable(&mut self, store: &mut dyn Store) -> Result<()> {
        self.meta.enabled = false;
        info!("auto dosing disabled");
        self.save_state(store)
    }

    pub fn set_daily_volume(&mut self, ml: f32, store: &mut dyn Store) -> Result<()> {
        if !(ml.is_finite() && ml >= 0.0) {
            return Err(eyre::Report::new(ScheduleError::InvalidVolume(ml)));
        }
        self.meta.total_daily_volume = ml;
        self.update_schedule();
        info!(daily_ml = ml, "daily volume set");
        self.save_state(store)
    }

    /// User percent split; `day + night` may be below 1, leaving the rest undosed.
    pub fn set_split(&mut self, day: f32, night: f32, store: &mut dyn Store) -> Result<()> {
        if !rules::split_ok(day, night) {
            return Err(eyre::Report::new(ScheduleError::InvalidSplit { day, night }));
        }
        self.settings.day_ratio = day;
        self.settings.night_ratio = night;
        self.update_schedule();
        info!(day, night, "split set");
        self.save_state(store)
    }

    /// Recompute the day/night pools and the advisory table.
    pub fn update_schedule(&mut self) {
        let s = &self.settings;
        let total = self.meta.total_daily_volume;
        self.meta.day_volume = total * s.day_ratio;
        self.meta.night_volume = total * s.night_ratio;
        self.meta.day_start_hour = s.day_start_hour;
        self.meta.day_end_hour = s.day_end_hour;
        self.table = match generate_weighted_schedule(
            s.slots,
            total,
            s.day_start_hour,
            s.day_end_hour,
            s.day_ratio,
            s.night_ratio,
        ) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "could not build schedule table");
                Vec::new()
            }
        };
    }

    // ── Time ─────────────────────────────────────────────────────────────────

    pub fn is_in_day_period(&self, now: u32) -> bool {
        let hour = util::local_hour(now, self.settings.utc_offset_secs);
        in_window(hour, self.settings.day_start_hour, self.settings.day_end_hour)
    }

    /// Volume of a dose due at `now`.
    pub fn calculate_dose_volume(&self, now: u32) -> f32 {
        let pool = if self.is_in_day_period(now) {
            self.meta.day_volume
        } else {
            self.meta.night_volume
        };
        pool / self.settings.doses_per_day() as f32
    }

    /// Next interval boundary strictly after `now` in local time, rolled to
    /// the next local midnight when it lands at or past `day_end_hour`.
    pub fn calculate_next_dosing_time(&self, now: u32) -> u32 {
        let offset = self.settings.utc_offset_secs;
        let interval = i64::from(self.settings.dose_interval_secs());
        let local = util::to_local_secs(now, offset);
        let boundary = (local.div_euclid(interval) + 1) * interval;
        let hour = boundary.rem_euclid(util::SECS_PER_DAY) / 3600;
        if hour >= i64::from(self.settings.day_end_hour) {
            util::next_local_midnight(now, offset)
        } else {
            util::from_local_secs(boundary, offset)
        }
    }

    fn reset_day(&mut self, now: u32) {
        self.meta.total_dosed_volume = 0.0;
        self.meta.doses_day = 0;
        self.meta.doses_night = 0;
        self.update_schedule();
        self.meta.next_dosing_time = self.calculate_next_dosing_time(now);
        self.ledger_time = now;
    }

    // ── Decision ─────────────────────────────────────────────────────────────

    /// One scheduling decision. Cheap when nothing is due; call every loop
    /// iteration.
    pub fn check_and_dose<D: StepperDriver>(
        &mut self,
        now: u32,
        now_ms: u64,
        pump: &mut PumpController<D>,
        store: &mut dyn Store,
    ) -> Result<DoseOutcome> {
        if !self.meta.enabled {
            return Ok(DoseOutcome::Disabled);
        }
        if now < self.settings.min_valid_epoch {
            return Ok(DoseOutcome::ClockInvalid);
        }
        if !pump.is_ready(now_ms) {
            return Ok(DoseOutcome::PumpBusy);
        }
        if self.last_check == Some(now) {
            return Ok(DoseOutcome::RateLimited);
        }
        self.last_check = Some(now);

        if self.meta.last_dosing_time == 0 {
            self.meta.last_dosing_time = now.saturating_sub(self.settings.dose_interval_secs());
            self.ledger_time = now;
            self.meta.next_dosing_time = self.calculate_next_dosing_time(now);
            info!(
                next = self.meta.next_dosing_time,
                "scheduler seeded after restart"
            );
            return Ok(DoseOutcome::Seeded {
                next: self.meta.next_dosing_time,
            });
        }
        if self.meta.next_dosing_time == 0 {
            self.meta.next_dosing_time = self.calculate_next_dosing_time(now);
        }

        if !util::same_local_day(self.ledger_time, now, self.settings.utc_offset_secs) {
            self.reset_day(now);
            info!(
                date = %util::local_date(now, self.settings.utc_offset_secs),
                next = self.meta.next_dosing_time,
                "new day; dosing ledger reset"
            );
            self.persist_quietly(store);
            return Ok(DoseOutcome::NewDay {
                next: self.meta.next_dosing_time,
            });
        }

        if now < self.meta.next_dosing_time {
            return Ok(DoseOutcome::NotDue {
                next: self.meta.next_dosing_time,
            });
        }

        let dose = self.calculate_dose_volume(now);
        let next = self.calculate_next_dosing_time(now);
        self.meta.next_dosing_time = next;

        if self.meta.total_dosed_volume + dose > self.meta.total_daily_volume {
            let reason = SkipReason::CapReached {
                dosed: self.meta.total_dosed_volume,
                dose,
                total: self.meta.total_daily_volume,
            };
            info!(%reason, next, "dose skipped");
            return Ok(DoseOutcome::Skipped { reason, next });
        }

        if pump.mode() == PumpMode::Peristaltic {
            pump.set_mode(PumpMode::Dosing);
        }
        let spm = pump.steps_per_ml();
        if !(spm.is_finite() && spm > 0.0) {
            let reason = SkipReason::Uncalibrated;
            warn!(%reason, next, "dose skipped");
            return Ok(DoseOutcome::Skipped { reason, next });
        }

        let steps = pump.move_by_volume(dose)?;
        if steps == 0 {
            let reason = SkipReason::ZeroSteps;
            warn!(%reason, dose, next, "dose skipped");
            return Ok(DoseOutcome::Skipped { reason, next });
        }

        self.meta.total_dosed_volume += dose;
        self.meta.last_dose_volume = dose;
        if self.is_in_day_period(now) {
            self.meta.doses_day += 1;
        } else {
            self.meta.doses_night += 1;
        }
        self.meta.last_dosing_time = now;
        self.ledger_time = now;
        self.persist_quietly(store);
        info!(
            dose_ml = dose,
            steps,
            dosed_ml = self.meta.total_dosed_volume,
            remaining_ml = self.remaining_daily_volume(),
            next,
            "dose started"
        );
        Ok(DoseOutcome::Dosed {
            volume_ml: dose,
            steps,
            next,
        })
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            meta: self.meta.clone(),
            remaining_daily_volume: self.remaining_daily_volume(),
            day_ratio: self.settings.day_ratio,
            night_ratio: self.settings.night_ratio,
            doses_per_hour: self.settings.doses_per_hour,
        }
    }

    pub fn status_lines(&self) -> Vec<String> {
        let m = &self.meta;
        let offset = self.settings.utc_offset_secs;
        let when = |t: u32| {
            if t == 0 {
                "--:--".to_owned()
            } else {
                util::local_hhmm(t, offset)
            }
        };
        vec![
            format!("Auto dosing: {}", if m.enabled { "on" } else { "off" }),
            format!("Daily volume: {:.2} mL", m.total_daily_volume),
            format!(
                "Day/night: {:.2}/{:.2} mL ({:02}-{:02})",
                m.day_volume, m.night_volume, m.day_start_hour, m.day_end_hour
            ),
            format!(
                "Dosed today: {:.2} mL, remaining {:.2} mL",
                m.total_dosed_volume,
                self.remaining_daily_volume()
            ),
            format!(
                "Last dose: {:.2} mL at {}",
                m.last_dose_volume,
                when(m.last_dosing_time)
            ),
            format!("Next dose: {}", when(m.next_dosing_time)),
            format!("Doses: {} day, {} night", m.doses_day, m.doses_night),
        ]
    }

    pub fn schedule_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.table.len() + 1);
        lines.push(format!(
            "Schedule: {} slots, {:.2} mL/day",
            self.table.len(),
            self.meta.total_daily_volume
        ));
        lines.extend(self.table.iter().map(ToString::to_string));
        lines
    }

    pub fn log_status(&self, sink: &mut dyn StatusSink) {
        for line in self.status_lines() {
            sink.show(&line);
        }
    }

    pub fn log_schedule(&self, sink: &mut dyn StatusSink) {
        for line in self.schedule_lines() {
            sink.show(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // 2024-03-10T00:00:00Z
    const DAY0: u32 = 1_710_028_800;
    const H: u32 = 3600;

    fn doser() -> AutoDoser {
        AutoDoser::new(ScheduleSettings::default())
    }

    #[rstest]
    #[case(DAY0 + 10 * H + 5, DAY0 + 10 * H + 1800)]
    #[case(DAY0 + 10 * H + 1800, DAY0 + 11 * H)]
    #[case(DAY0 + 22 * H + 1799, DAY0 + 22 * H + 1800)]
    #[case(DAY0 + 22 * H + 1800, DAY0 + 24 * H)]
    #[case(DAY0 + 23 * H + 10, DAY0 + 24 * H)]
    fn next_time_rounds_up_and_rolls_past_window(#[case] now: u32, #[case] expected: u32) {
        assert_eq!(doser().calculate_next_dosing_time(now), expected);
    }

    #[test]
    fn next_time_uses_local_boundaries() {
        let mut settings = ScheduleSettings::default();
        settings.utc_offset_secs = 2 * 3600;
        let d = AutoDoser::new(settings);
        // 20:45Z is 22:45 local; the 23:00 local boundary is past the window.
        let now = DAY0 + 20 * H + 2700;
        assert_eq!(d.calculate_next_dosing_time(now), DAY0 + 22 * H);
    }

    #[test]
    fn full_day_window_never_rolls() {
        let mut settings = ScheduleSettings::default();
        settings.day_end_hour = 24;
        let d = AutoDoser::new(settings);
        assert_eq!(
            d.calculate_next_dosing_time(DAY0 + 23 * H + 40 * 60),
            DAY0 + 24 * H
        );
    }

    #[test]
    fn dose_volume_depends_on_period() {
        let d = doser();
        // 30 mL, 70/30, 48 doses per day
        assert!((d.calculate_dose_volume(DAY0 + 12 * H) - 21.0 / 48.0).abs() < 1e-6);
        assert!((d.calculate_dose_volume(DAY0 + 3 * H) - 9.0 / 48.0).abs() < 1e-6);
        assert!(d.is_in_day_period(DAY0 + 11 * H));
        assert!(!d.is_in_day_period(DAY0 + 23 * H));
    }

    #[test]
    fn user_split_below_one_leaves_remainder_undosed() {
        let mut d = doser();
        let mut store = crate::mocks::MemoryStore::default();
        d.set_split(0.5, 0.25, &mut store).unwrap();
        assert!((d.meta().day_volume - 15.0).abs() < 1e-6);
        assert!((d.meta().night_volume - 7.5).abs() < 1e-6);
        assert!(d.set_split(0.8, 0.4, &mut store).is_err());
    }

    #[test]
    fn status_lines_mention_volumes() {
        let d = doser();
        let lines = d.status_lines();
        assert!(lines.iter().any(|l| l.contains("Daily volume: 30.00 mL")));
        assert!(lines.iter().any(|l| l == "Next dose: --:--"));
        assert_eq!(d.schedule_lines().len(), 49);
    }
}
