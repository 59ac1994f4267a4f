//! `From` implementations bridging `pump_config` types to `pump_core` types.

use crate::config::{CalibrationRun, Kinematics, PumpCalibration, ScheduleSettings};
use crate::pump::PumpMode;

// ── Kinematics ───────────────────────────────────────────────────────────────

impl From<&pump_config::MotorCfg> for Kinematics {
    fn from(c: &pump_config::MotorCfg) -> Self {
        Self {
            max_speed: c.max_speed,
            acceleration: c.acceleration,
            microsteps: c.microsteps,
            steps_per_tick: c.steps_per_tick,
            hold_delay_ms: c.hold_delay_ms,
        }
    }
}

// ── Calibration ──────────────────────────────────────────────────────────────

impl From<&pump_config::CalibrationCfg> for PumpCalibration {
    fn from(c: &pump_config::CalibrationCfg) -> Self {
        Self {
            dosing_steps_per_ml: c.dosing_steps_per_ml,
            peristaltic_steps_per_ml: c.peristaltic_steps_per_ml,
        }
    }
}

impl From<&pump_config::CalibrationCfg> for CalibrationRun {
    fn from(c: &pump_config::CalibrationCfg) -> Self {
        Self {
            target_mode: PumpMode::Dosing,
            fixed_steps: c.fixed_steps,
            speed: c.speed,
            timeout_ms: c.timeout_ms,
            stall_ms: c.stall_ms,
        }
    }
}

// ── Schedule ─────────────────────────────────────────────────────────────────

impl From<&pump_config::ScheduleCfg> for ScheduleSettings {
    fn from(c: &pump_config::ScheduleCfg) -> Self {
        Self {
            default_daily_volume: c.default_daily_volume_ml,
            day_start_hour: c.day_start_hour,
            day_end_hour: c.day_end_hour,
            doses_per_hour: c.doses_per_hour,
            day_ratio: c.day_ratio,
            night_ratio: c.night_ratio,
            slots: c.slots,
            utc_offset_secs: c.utc_offset_minutes.saturating_mul(60),
            min_valid_epoch: c.min_valid_epoch,
        }
    }
}
