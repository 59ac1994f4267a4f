pub mod clock;

pub use clock::{Clock, ManualClock, ManualWallClock, MonotonicClock, SystemWallClock, WallClock};

pub type DriverResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Stepper driver capability set consumed by the pump motion controller.
///
/// Positions are signed (micro)step counts. `run_toward_target` and
/// `run_at_speed` are the bounded advance primitives: each call performs at
/// most `max_steps` steps and returns how many were actually taken, so a
/// single control-loop iteration never spins unbounded.
pub trait StepperDriver {
    fn set_enabled(&mut self, enabled: bool) -> DriverResult;
    fn set_microsteps(&mut self, microsteps: u16) -> DriverResult;
    fn set_max_speed(&mut self, steps_per_sec: f32);
    fn set_acceleration(&mut self, steps_per_sec2: f32);
    /// Constant speed used by `run_at_speed`; sign selects direction.
    fn set_speed(&mut self, steps_per_sec: f32);
    fn move_to(&mut self, target: i64);
    /// Redefine the current position. The target is set to the same value so
    /// no motion is pending afterwards.
    fn set_current_position(&mut self, position: i64);
    fn current_position(&self) -> i64;
    fn target_position(&self) -> i64;
    fn distance_to_go(&self) -> i64 {
        self.target_position() - self.current_position()
    }
    fn run_toward_target(&mut self, max_steps: u32) -> DriverResult<u32>;
    fn run_at_speed(&mut self, max_steps: u32) -> DriverResult<u32>;
    /// Drop any pending motion immediately (target = current, speed = 0).
    fn halt(&mut self);
}

impl<T: StepperDriver + ?Sized> StepperDriver for Box<T> {
    fn set_enabled(&mut self, enabled: bool) -> DriverResult {
        (**self).set_enabled(enabled)
    }
    fn set_microsteps(&mut self, microsteps: u16) -> DriverResult {
        (**self).set_microsteps(microsteps)
    }
    fn set_max_speed(&mut self, steps_per_sec: f32) {
        (**self).set_max_speed(steps_per_sec);
    }
    fn set_acceleration(&mut self, steps_per_sec2: f32) {
        (**self).set_acceleration(steps_per_sec2);
    }
    fn set_speed(&mut self, steps_per_sec: f32) {
        (**self).set_speed(steps_per_sec);
    }
    fn move_to(&mut self, target: i64) {
        (**self).move_to(target);
    }
    fn set_current_position(&mut self, position: i64) {
        (**self).set_current_position(position);
    }
    fn current_position(&self) -> i64 {
        (**self).current_position()
    }
    fn target_position(&self) -> i64 {
        (**self).target_position()
    }
    fn run_toward_target(&mut self, max_steps: u32) -> DriverResult<u32> {
        (**self).run_toward_target(max_steps)
    }
    fn run_at_speed(&mut self, max_steps: u32) -> DriverResult<u32> {
        (**self).run_at_speed(max_steps)
    }
    fn halt(&mut self) {
        (**self).halt();
    }
}

/// A value held in the durable key-value store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreValue {
    Bool(bool),
    F32(f32),
    U32(u32),
    U8(u8),
}

impl StoreValue {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            StoreValue::Bool(b) => Some(b),
            _ => None,
        }
    }
    /// Integers are accepted too, so a hand-edited `30` reads as `30.0`.
    pub fn as_f32(self) -> Option<f32> {
        match self {
            StoreValue::F32(v) => Some(v),
            StoreValue::U32(v) => Some(v as f32),
            StoreValue::U8(v) => Some(f32::from(v)),
            StoreValue::Bool(_) => None,
        }
    }
    pub fn as_u32(self) -> Option<u32> {
        match self {
            StoreValue::U32(v) => Some(v),
            StoreValue::U8(v) => Some(u32::from(v)),
            _ => None,
        }
    }
    pub fn as_u8(self) -> Option<u8> {
        match self {
            StoreValue::U8(v) => Some(v),
            StoreValue::U32(v) => u8::try_from(v).ok(),
            _ => None,
        }
    }
}

/// Flat, key-addressed durable store (EEPROM-like).
///
/// `put` stages a value; `commit` makes all staged values durable.
pub trait Store {
    fn get(&self, key: &str) -> Option<StoreValue>;
    fn put(&mut self, key: &str, value: StoreValue);
    fn commit(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: Store + ?Sized> Store for Box<T> {
    fn get(&self, key: &str) -> Option<StoreValue> {
        (**self).get(key)
    }
    fn put(&mut self, key: &str, value: StoreValue) {
        (**self).put(key, value);
    }
    fn commit(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).commit()
    }
}

/// Receives human-readable status lines (display, serial console, log).
pub trait StatusSink {
    fn show(&mut self, line: &str);
}
