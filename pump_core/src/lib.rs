#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core pump logic (hardware-agnostic).
//!
//! All hardware interactions go through the `pump_traits::StepperDriver` and
//! `pump_traits::Store` traits.
//!
//! ## Architecture
//!
//! - **Motion**: `{Peristaltic, Dosing, Holding}` mode machine with bounded,
//!   non-blocking bursts (`pump` module)
//! - **Calibration**: polled steps-per-mL sub-state machine (`calibration` module)
//! - **Scheduling**: day/night auto-dosing with a hard daily cap (`scheduler`
//!   module) plus an advisory per-slot table (`schedule` module)
//! - **Persistence**: flat key map with validated loads (`persist` module)
//! - **Loop**: single-threaded cooperative `ControlLoop` (`runner` module)
//!
//! ## Time
//!
//! Motion and calibration use a monotonic millisecond counter. Scheduling uses
//! `u32` epoch seconds; calendar days are local days under a fixed UTC offset.

pub mod calibration;
pub mod config;
pub mod conversions;
pub mod error;
pub mod hw_error;
pub mod mocks;
pub mod persist;
pub mod pump;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod status;
pub mod util;

pub use calibration::{CalibrationEvent, CalibrationOutcome, CalibrationSession, CalibrationState};
pub use config::{CalibrationRun, Kinematics, PumpCalibration, ScheduleSettings};
pub use error::{BuildError, CalibrationError, PumpError, Report, Result, ScheduleError};
pub use pump::{PumpController, PumpMode};
pub use runner::{ControlLoop, ControlLoopBuilder, LoopTick, Missing};
pub use schedule::{DoseScheduleEntry, generate_weighted_schedule};
pub use scheduler::{AutoDoser, DoseOutcome, DosingScheduleMeta, SchedulerStatus, SkipReason};
pub use status::{MotionStatus, TracingSink};
