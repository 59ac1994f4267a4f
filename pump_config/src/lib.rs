#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and the file-backed durable store for the pump controller.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - `FileStore` keeps the flat persisted field map in a small TOML file,
//!   written atomically on every commit.
use serde::Deserialize;

use crate::rules::positive_finite;

pub mod rules;
pub mod store;

pub use store::{FileStore, write_atomic};

/// Steps per mL used when nothing valid has been calibrated or persisted.
pub const DEFAULT_STEPS_PER_ML: f32 = 709.22;

/// 2023-01-01T00:00:00Z. Anything earlier means the RTC was never synchronized.
pub const DEFAULT_MIN_VALID_EPOCH: u32 = 1_672_531_200;

#[derive(Debug, Deserialize)]
pub struct Pins {
    pub step: u8,
    pub dir: u8,
    pub enable: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MotorCfg {
    /// Upper bound for any commanded speed (steps/s)
    pub max_speed: f32,
    /// steps/s^2
    pub acceleration: f32,
    /// Driver microstep multiplier (power of two, 1..=256)
    pub microsteps: u16,
    /// Max micro-steps issued per control-loop tick
    pub steps_per_tick: u32,
    /// Cooldown after a finished dosing move before the next one is accepted
    pub hold_delay_ms: u64,
    /// Speed restored at boot when nothing was saved (steps/s)
    pub default_speed: f32,
}

impl Default for MotorCfg {
    fn default() -> Self {
        Self {
            max_speed: 4000.0,
            acceleration: 100.0,
            microsteps: 256,
            steps_per_tick: 16,
            hold_delay_ms: 250,
            default_speed: 2000.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CalibrationCfg {
    pub dosing_steps_per_ml: f32,
    pub peristaltic_steps_per_ml: f32,
    /// Step count of a calibration run
    pub fixed_steps: i64,
    /// Speed of a calibration run (steps/s)
    pub speed: f32,
    pub timeout_ms: u64,
    /// Declare a stall when the motor made no progress for this long
    pub stall_ms: u64,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            dosing_steps_per_ml: DEFAULT_STEPS_PER_ML,
            peristaltic_steps_per_ml: DEFAULT_STEPS_PER_ML,
            fixed_steps: 200_000,
            speed: 2000.0,
            timeout_ms: 120_000,
            stall_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleCfg {
    /// Daily volume used when storage holds nothing valid (mL)
    pub default_daily_volume_ml: f32,
    pub day_start_hour: u8,
    /// Exclusive end of the day window; 24 means midnight
    pub day_end_hour: u8,
    pub doses_per_hour: u32,
    pub day_ratio: f32,
    pub night_ratio: f32,
    /// Slot count of the advisory per-slot timetable
    pub slots: u32,
    /// Fixed offset of local time from UTC, used for calendar-day decisions
    pub utc_offset_minutes: i32,
    pub min_valid_epoch: u32,
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            default_daily_volume_ml: 30.0,
            day_start_hour: 11,
            day_end_hour: 23,
            doses_per_hour: 2,
            day_ratio: 0.7,
            night_ratio: 0.3,
            slots: 48,
            utc_offset_minutes: 0,
            min_valid_epoch: DEFAULT_MIN_VALID_EPOCH,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageCfg {
    /// Path of the persisted state file
    pub path: String,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            path: "var/pump_state.toml".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlLoopCfg {
    /// Sleep between control-loop iterations (ms)
    pub period_ms: u64,
}

impl Default for ControlLoopCfg {
    fn default() -> Self {
        Self { period_ms: 2 }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub pins: Pins,
    #[serde(default)]
    pub motor: MotorCfg,
    #[serde(default)]
    pub calibration: CalibrationCfg,
    #[serde(default)]
    pub schedule: ScheduleCfg,
    #[serde(default)]
    pub storage: StorageCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub control_loop: ControlLoopCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read and parse a config file, then validate it.
pub fn load_file(path: &std::path::Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Motor
        if !positive_finite(self.motor.max_speed) {
            eyre::bail!("motor.max_speed must be > 0");
        }
        if !positive_finite(self.motor.acceleration) {
            eyre::bail!("motor.acceleration must be > 0");
        }
        if !(1..=256).contains(&self.motor.microsteps) || !self.motor.microsteps.is_power_of_two()
        {
            eyre::bail!("motor.microsteps must be a power of two in [1, 256]");
        }
        if self.motor.steps_per_tick == 0 {
            eyre::bail!("motor.steps_per_tick must be >= 1");
        }
        if self.motor.hold_delay_ms > 60_000 {
            eyre::bail!("motor.hold_delay_ms is unreasonably large (>60s)");
        }
        if !self.motor.default_speed.is_finite()
            || self.motor.default_speed < 0.0
            || self.motor.default_speed > self.motor.max_speed
        {
            eyre::bail!("motor.default_speed must be in [0, motor.max_speed]");
        }

        // Calibration
        if !positive_finite(self.calibration.dosing_steps_per_ml) {
            eyre::bail!("calibration.dosing_steps_per_ml must be > 0");
        }
        if !positive_finite(self.calibration.peristaltic_steps_per_ml) {
            eyre::bail!("calibration.peristaltic_steps_per_ml must be > 0");
        }
        if self.calibration.fixed_steps <= 0 {
            eyre::bail!("calibration.fixed_steps must be > 0");
        }
        if !positive_finite(self.calibration.speed) {
            eyre::bail!("calibration.speed must be > 0");
        }
        if self.calibration.timeout_ms == 0 {
            eyre::bail!("calibration.timeout_ms must be >= 1");
        }
        let cal = &self.calibration;
        if cal.stall_ms == 0 || cal.stall_ms >= cal.timeout_ms {
            eyre::bail!("calibration.stall_ms must be in [1, calibration.timeout_ms)");
        }

        // Schedule
        let s = &self.schedule;
        if !s.default_daily_volume_ml.is_finite() || s.default_daily_volume_ml < 0.0 {
            eyre::bail!("schedule.default_daily_volume_ml must be >= 0");
        }
        if s.day_start_hour > 23 {
            eyre::bail!("schedule.day_start_hour must be in [0, 23]");
        }
        if !rules::day_window_ok(s.day_start_hour, s.day_end_hour) {
            eyre::bail!("schedule.day_end_hour must be in (day_start_hour, 24]");
        }
        if !rules::doses_per_hour_ok(s.doses_per_hour) {
            eyre::bail!("schedule.doses_per_hour must divide 60");
        }
        for (name, r) in [("day_ratio", s.day_ratio), ("night_ratio", s.night_ratio)] {
            if !rules::fraction(r) {
                eyre::bail!("schedule.{name} must be in [0.0, 1.0]");
            }
        }
        if !rules::split_ok(s.day_ratio, s.night_ratio) {
            eyre::bail!("schedule.day_ratio + schedule.night_ratio must be <= 1.0");
        }
        if s.slots == 0 || s.slots > 1440 {
            eyre::bail!("schedule.slots must be in [1, 1440]");
        }
        if 1440 % s.slots != 0 {
            tracing::warn!(
                slots = s.slots,
                "schedule.slots does not divide 1440; timetable will not span the full day"
            );
        }
        if !rules::utc_offset_ok(i64::from(s.utc_offset_minutes) * 60) {
            eyre::bail!("schedule.utc_offset_minutes must be within +/-14h");
        }

        // Storage
        if self.storage.path.trim().is_empty() {
            eyre::bail!("storage.path must not be empty");
        }

        // Control loop
        if self.control_loop.period_ms > 10 {
            eyre::bail!("control_loop.period_ms must be <= 10 to keep motion smooth");
        }

        Ok(())
    }
}
