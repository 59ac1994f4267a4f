//! Configuration types for the pump controller and scheduler.
//!
//! These are the runtime configuration structs used by `PumpController`,
//! `CalibrationSession` and `AutoDoser`. They are separate from the
//! TOML-deserialized config in `pump_config`.

use pump_config::{DEFAULT_MIN_VALID_EPOCH, DEFAULT_STEPS_PER_ML};

use crate::pump::PumpMode;

/// Steps-per-mL calibration, one constant per physical operating mode.
/// A value `<= 0` (or NaN) means uncalibrated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpCalibration {
    pub dosing_steps_per_ml: f32,
    pub peristaltic_steps_per_ml: f32,
}

impl PumpCalibration {
    /// Constant used for volume moves in `mode`. Holding follows Dosing since
    /// it is the rest state between dosing moves.
    pub fn for_mode(&self, mode: PumpMode) -> f32 {
        match mode {
            PumpMode::Peristaltic => self.peristaltic_steps_per_ml,
            PumpMode::Dosing | PumpMode::Holding => self.dosing_steps_per_ml,
        }
    }

    pub fn set_for_mode(&mut self, mode: PumpMode, steps_per_ml: f32) {
        match mode {
            PumpMode::Peristaltic => self.peristaltic_steps_per_ml = steps_per_ml,
            PumpMode::Dosing | PumpMode::Holding => self.dosing_steps_per_ml = steps_per_ml,
        }
    }
}

impl Default for PumpCalibration {
    fn default() -> Self {
        Self {
            dosing_steps_per_ml: DEFAULT_STEPS_PER_ML,
            peristaltic_steps_per_ml: DEFAULT_STEPS_PER_ML,
        }
    }
}

/// Motion limits pushed to the driver on `begin()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    /// steps/s
    pub max_speed: f32,
    /// steps/s^2
    pub acceleration: f32,
    pub microsteps: u16,
    /// Upper bound of micro-steps issued per `tick()`.
    pub steps_per_tick: u32,
    /// Cooldown after a finished dosing move before `is_ready()` reports true.
    pub hold_delay_ms: u64,
}

impl Default for Kinematics {
    fn default() -> Self {
        Self {
            max_speed: 4000.0,
            acceleration: 100.0,
            microsteps: 256,
            steps_per_tick: 16,
            hold_delay_ms: 250,
        }
    }
}

/// Parameters of one calibration move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRun {
    /// Which per-mode constant the result is written to.
    pub target_mode: PumpMode,
    pub fixed_steps: i64,
    /// steps/s
    pub speed: f32,
    pub timeout_ms: u64,
    pub stall_ms: u64,
}

impl Default for CalibrationRun {
    fn default() -> Self {
        Self {
            target_mode: PumpMode::Dosing,
            fixed_steps: 200_000,
            speed: 2000.0,
            timeout_ms: 120_000,
            stall_ms: 2000,
        }
    }
}

/// Auto-dosing cadence and day/night split.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSettings {
    pub default_daily_volume: f32,
    pub day_start_hour: u8,
    /// Exclusive; 24 means the window runs to midnight.
    pub day_end_hour: u8,
    pub doses_per_hour: u32,
    pub day_ratio: f32,
    pub night_ratio: f32,
    /// Slot count of the advisory per-slot timetable.
    pub slots: u32,
    /// Local time = UTC + offset. Calendar-day decisions use local time.
    pub utc_offset_secs: i32,
    pub min_valid_epoch: u32,
}

impl ScheduleSettings {
    /// Seconds between dosing opportunities.
    pub fn dose_interval_secs(&self) -> u32 {
        3600 / self.doses_per_hour.max(1)
    }

    pub fn doses_per_day(&self) -> u32 {
        self.doses_per_hour.max(1) * 24
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            default_daily_volume: 30.0,
            day_start_hour: 11,
            day_end_hour: 23,
            doses_per_hour: 2,
            day_ratio: 0.7,
            night_ratio: 0.3,
            slots: 48,
            utc_offset_secs: 0,
            min_valid_epoch: DEFAULT_MIN_VALID_EPOCH,
        }
    }
}
