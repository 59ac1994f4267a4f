use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum PumpError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("pump not started; call begin() first")]
    NotStarted,
    #[error("invalid state: {0}")]
    State(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration failed: motor stalled after {moved} of {target} steps")]
    Stalled { moved: i64, target: i64 },
    #[error("calibration failed: timed out after {moved} of {target} steps")]
    TimedOut { moved: i64, target: i64 },
    #[error("calibration aborted")]
    Aborted,
    #[error("a calibration run is already in progress")]
    AlreadyRunning,
    #[error("no calibration run is waiting for a measured volume")]
    NotAwaitingVolume,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("slot count must be in [1, 1440], got {0}")]
    InvalidSlots(u32),
    #[error("daily volume must be a finite value >= 0, got {0}")]
    InvalidVolume(f32),
    #[error("split must be two fractions in [0, 1] summing to <= 1, got {day}/{night}")]
    InvalidSplit { day: f32, night: f32 },
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
