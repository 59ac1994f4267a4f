//! Durable store keys and validated loads.
//!
//! Every read goes through a validator: a missing key yields the caller's
//! default, a present-but-invalid value (NaN, negative, wrong type) is logged
//! and replaced by a safe constant.

use pump_config::DEFAULT_STEPS_PER_ML;
use pump_traits::{Store, StoreValue};
use tracing::warn;

use crate::config::PumpCalibration;
use crate::error::PumpError;
use crate::hw_error::map_store_error;
use crate::pump::PumpMode;

pub mod keys {
    pub const ENABLED: &str = "enabled";
    pub const TOTAL_DAILY_VOLUME: &str = "total_daily_volume";
    pub const LAST_DOSING_TIME: &str = "last_dosing_time";
    pub const TOTAL_DOSED_VOLUME: &str = "total_dosed_volume";
    pub const DOSING_STEPS_PER_ML: &str = "dosing_steps_per_ml";
    pub const PERISTALTIC_STEPS_PER_ML: &str = "peristaltic_steps_per_ml";
    pub const SAVED_SPEED: &str = "saved_speed";
    pub const MODE: &str = "mode";
    pub const DAY_PERCENT: &str = "day_percent";
    pub const NIGHT_PERCENT: &str = "night_percent";
}

/// Read an `f32`: `default` when missing, `invalid` when the stored value is
/// rejected by `valid`.
pub fn load_f32(
    store: &dyn Store,
    key: &str,
    default: f32,
    invalid: f32,
    valid: impl Fn(f32) -> bool,
) -> f32 {
    match store.get(key) {
        None => default,
        Some(v) => match v.as_f32() {
            Some(x) if valid(x) => x,
            _ => {
                warn!(key, value = ?v, fallback = invalid, "invalid stored value");
                invalid
            }
        },
    }
}

pub fn load_u32(store: &dyn Store, key: &str, default: u32) -> u32 {
    match store.get(key) {
        None => default,
        Some(v) => v.as_u32().unwrap_or_else(|| {
            warn!(key, value = ?v, "invalid stored value");
            default
        }),
    }
}

pub fn load_bool(store: &dyn Store, key: &str, default: bool) -> bool {
    match store.get(key) {
        None => default,
        Some(v) => v.as_bool().unwrap_or_else(|| {
            warn!(key, value = ?v, "invalid stored value");
            default
        }),
    }
}

#[inline]
pub fn valid_steps_per_ml(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

#[inline]
pub fn valid_non_negative(v: f32) -> bool {
    v.is_finite() && v >= 0.0
}

/// Per-mode calibration. Missing keys keep `fallback`; corrupt ones reset to
/// [`DEFAULT_STEPS_PER_ML`].
pub fn load_calibration(store: &dyn Store, fallback: PumpCalibration) -> PumpCalibration {
    PumpCalibration {
        dosing_steps_per_ml: load_f32(
            store,
            keys::DOSING_STEPS_PER_ML,
            fallback.dosing_steps_per_ml,
            DEFAULT_STEPS_PER_ML,
            valid_steps_per_ml,
        ),
        peristaltic_steps_per_ml: load_f32(
            store,
            keys::PERISTALTIC_STEPS_PER_ML,
            fallback.peristaltic_steps_per_ml,
            DEFAULT_STEPS_PER_ML,
            valid_steps_per_ml,
        ),
    }
}

pub fn save_calibration(store: &mut dyn Store, cal: &PumpCalibration) {
    store.put(
        keys::DOSING_STEPS_PER_ML,
        StoreValue::F32(cal.dosing_steps_per_ml),
    );
    store.put(
        keys::PERISTALTIC_STEPS_PER_ML,
        StoreValue::F32(cal.peristaltic_steps_per_ml),
    );
}

/// Speed and mode the pump was last left in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedMotion {
    pub speed: f32,
    pub mode: PumpMode,
}

pub fn load_motion(store: &dyn Store, default_speed: f32) -> SavedMotion {
    let speed = load_f32(
        store,
        keys::SAVED_SPEED,
        default_speed,
        default_speed,
        valid_non_negative,
    );
    let mode = match store.get(keys::MODE) {
        None => PumpMode::Holding,
        Some(v) => v.as_u8().and_then(PumpMode::from_code).unwrap_or_else(|| {
            warn!(value = ?v, "invalid stored mode");
            PumpMode::Holding
        }),
    };
    SavedMotion { speed, mode }
}

pub fn save_motion(store: &mut dyn Store, motion: SavedMotion) {
    store.put(keys::SAVED_SPEED, StoreValue::F32(motion.speed));
    store.put(keys::MODE, StoreValue::U8(motion.mode.code()));
}

pub fn commit(store: &mut dyn Store) -> Result<(), PumpError> {
    store.commit().map_err(|e| map_store_error(&*e))
}
