//! Pump motion controller (`PumpController`).
//!
//! Owns the stepper driver and the `{Peristaltic, Dosing, Holding}` mode
//! machine. Motion is non-blocking: callers issue a move and then call
//! [`PumpController::tick`] once per control-loop iteration, which advances the
//! driver by at most `steps_per_tick` steps.

use tracing::{debug, info, warn};

use pump_traits::{DriverResult, StepperDriver};

use crate::config::{Kinematics, PumpCalibration};
use crate::error::{PumpError, Result};
use crate::hw_error::map_hw_error;
use crate::status::MotionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpMode {
    /// Continuous rotation at the configured speed.
    Peristaltic,
    /// Position-controlled move of a precise step count.
    Dosing,
    /// Rest and post-move cooldown.
    Holding,
}

impl PumpMode {
    /// Stable code used by the durable store.
    pub const fn code(self) -> u8 {
        match self {
            PumpMode::Peristaltic => 0,
            PumpMode::Dosing => 1,
            PumpMode::Holding => 2,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PumpMode::Peristaltic),
            1 => Some(PumpMode::Dosing),
            2 => Some(PumpMode::Holding),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PumpMode::Peristaltic => "peristaltic",
            PumpMode::Dosing => "dosing",
            PumpMode::Holding => "holding",
        }
    }
}

impl core::fmt::Display for PumpMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that drive the mode machine. All mode changes go through
/// [`PumpController::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Select(PumpMode),
    StartMove,
    MoveComplete,
    RunContinuous,
    Stop,
}

#[inline]
fn is_calibrated(steps_per_ml: f32) -> bool {
    steps_per_ml.is_finite() && steps_per_ml > 0.0
}

pub struct PumpController<D: StepperDriver> {
    driver: D,
    mode: PumpMode,
    enabled: bool,
    current_speed: f32,
    kinematics: Kinematics,
    calibration: PumpCalibration,
    began: bool,
    move_active: bool,
    move_origin: i64,
    last_completed_steps: i64,
    held_since_ms: Option<u64>,
}

impl<D: StepperDriver> core::fmt::Debug for PumpController<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PumpController")
            .field("mode", &self.mode)
            .field("enabled", &self.enabled)
            .field("speed", &self.current_speed)
            .field("position", &self.driver.current_position())
            .field("distance_to_go", &self.driver.distance_to_go())
            .finish()
    }
}

impl<D: StepperDriver> PumpController<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            mode: PumpMode::Holding,
            enabled: false,
            current_speed: 0.0,
            kinematics: Kinematics::default(),
            calibration: PumpCalibration::default(),
            began: false,
            move_active: false,
            move_origin: 0,
            last_completed_steps: 0,
            held_since_ms: None,
        }
    }

    /// Store calibration and motion limits. Nothing reaches the driver until
    /// [`begin`](Self::begin).
    pub fn configure(&mut self, calibration: PumpCalibration, kinematics: Kinematics) {
        self.calibration = calibration;
        self.kinematics = kinematics;
        self.current_speed = self.current_speed.clamp(0.0, kinematics.max_speed.max(0.0));
    }

    /// Push kinematics to the driver and leave it disabled.
    pub fn begin(&mut self) -> Result<()> {
        self.driver
            .set_microsteps(self.kinematics.microsteps)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
        self.driver.set_max_speed(self.kinematics.max_speed);
        self.driver.set_acceleration(self.kinematics.acceleration);
        self.driver.set_speed(0.0);
        self.began = true;
        self.write_enable(false)?;
        self.transition(Trigger::Stop);
        info!(
            max_speed = self.kinematics.max_speed,
            acceleration = self.kinematics.acceleration,
            microsteps = self.kinematics.microsteps,
            "pump ready"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.began
    }

    // ── Mode machine ─────────────────────────────────────────────────────────

    fn transition(&mut self, trigger: Trigger) -> PumpMode {
        let next = match (self.mode, trigger) {
            (_, Trigger::Select(mode)) => mode,
            (_, Trigger::StartMove) => PumpMode::Dosing,
            (PumpMode::Dosing, Trigger::MoveComplete) => PumpMode::Holding,
            (mode, Trigger::MoveComplete) => mode,
            (_, Trigger::RunContinuous) => PumpMode::Peristaltic,
            (_, Trigger::Stop) => PumpMode::Holding,
        };
        if next != self.mode {
            debug!(from = %self.mode, to = %next, ?trigger, "pump mode");
        }
        self.mode = next;
        next
    }

    /// Select an operating mode. Switching between Peristaltic and Dosing
    /// keeps the logical position; selecting Holding is a [`stop`](Self::stop).
    pub fn set_mode(&mut self, mode: PumpMode) {
        match mode {
            PumpMode::Holding => self.stop(),
            PumpMode::Peristaltic => {
                if self.move_active {
                    self.driver.halt();
                    self.move_active = false;
                }
                self.transition(Trigger::Select(mode));
            }
            PumpMode::Dosing => {
                self.transition(Trigger::Select(mode));
            }
        }
    }

    // ── Motion ───────────────────────────────────────────────────────────────

    fn ensure_started(&self) -> Result<()> {
        if self.began {
            Ok(())
        } else {
            Err(eyre::Report::new(PumpError::NotStarted))
        }
    }

    fn write_enable(&mut self, enabled: bool) -> Result<()> {
        self.driver
            .set_enabled(enabled)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
        self.enabled = enabled;
        Ok(())
    }

    /// Force the pump to a stopped, disabled state after a driver failure.
    fn fail_safe(&mut self, err: &(dyn std::error::Error + 'static)) -> eyre::Report {
        let mapped = map_hw_error(err);
        warn!(error = %mapped, "driver error; forcing pump to holding");
        self.driver.halt();
        if let Err(e) = self.driver.set_enabled(false) {
            warn!(error = %e, "could not disable driver");
        }
        self.enabled = false;
        if self.move_active {
            self.last_completed_steps = self.driver.current_position() - self.move_origin;
        }
        self.move_active = false;
        self.transition(Trigger::Stop);
        eyre::Report::new(mapped)
    }

    fn start_position_move(&mut self) -> Result<()> {
        let speed = if self.current_speed > 0.0 {
            self.current_speed
        } else {
            self.kinematics.max_speed
        };
        self.driver.set_max_speed(speed);
        self.driver.set_acceleration(self.kinematics.acceleration);
        self.move_origin = self.driver.current_position();
        self.transition(Trigger::StartMove);
        self.move_active = self.driver.distance_to_go() != 0;
        if !self.move_active {
            return Ok(());
        }
        self.held_since_ms = None;
        if let Err(e) = self.write_enable(true) {
            self.move_active = false;
            self.driver.halt();
            self.transition(Trigger::Stop);
            return Err(e);
        }
        Ok(())
    }

    /// Move `steps` relative to the current position.
    pub fn move_relative(&mut self, steps: i64) -> Result<()> {
        self.ensure_started()?;
        let target = self.driver.current_position().saturating_add(steps);
        self.driver.move_to(target);
        self.start_position_move()
    }

    pub fn move_to_position(&mut self, position: i64) -> Result<()> {
        self.ensure_started()?;
        self.driver.move_to(position);
        self.start_position_move()
    }

    /// Dispense `ml` using the calibration of the mode in effect. The logical
    /// position is zeroed first and the move is `round(ml * steps_per_ml)`
    /// steps, so a negative volume runs in reverse. Returns the signed number
    /// of steps commanded; `0` when uncalibrated or `ml` is not finite.
    pub fn move_by_volume(&mut self, ml: f32) -> Result<i64> {
        self.ensure_started()?;
        let steps_per_ml = self.steps_per_ml();
        if !is_calibrated(steps_per_ml) {
            warn!(steps_per_ml, ml, "pump not calibrated; volume move suppressed");
            return Ok(0);
        }
        if !ml.is_finite() {
            warn!(ml, "volume is not finite; nothing to move");
            return Ok(0);
        }
        self.driver.set_current_position(0);
        let steps = (f64::from(ml) * f64::from(steps_per_ml)).round() as i64;
        if steps == 0 {
            debug!(ml, "volume rounds to zero steps");
            return Ok(0);
        }
        self.driver.move_to(steps);
        self.start_position_move()?;
        info!(ml, steps, steps_per_ml, "volume move started");
        Ok(steps)
    }

    /// Run in Peristaltic mode at the current speed until [`stop`](Self::stop).
    pub fn run_continuous(&mut self) -> Result<()> {
        self.ensure_started()?;
        if self.current_speed <= 0.0 {
            return Err(eyre::Report::new(PumpError::State(
                "continuous run needs a speed > 0".into(),
            )));
        }
        if self.move_active {
            self.driver.halt();
            self.move_active = false;
        }
        self.transition(Trigger::RunContinuous);
        self.driver.set_speed(self.current_speed);
        self.held_since_ms = None;
        self.write_enable(true)?;
        info!(speed = self.current_speed, "continuous run");
        Ok(())
    }

    /// Halt immediately, disable the driver, clear the speed and rest in Holding.
    pub fn stop(&mut self) {
        self.driver.halt();
        if self.move_active {
            self.last_completed_steps = self.driver.current_position() - self.move_origin;
            self.move_active = false;
        }
        if let Err(e) = self.driver.set_enabled(false) {
            warn!(error = %e, "could not disable driver on stop");
        }
        self.enabled = false;
        self.current_speed = 0.0;
        self.driver.set_speed(0.0);
        self.transition(Trigger::Stop);
    }

    fn complete_move(&mut self, now_ms: u64) -> Result<MotionStatus> {
        let steps = self.driver.current_position() - self.move_origin;
        self.last_completed_steps = steps;
        self.move_active = false;
        self.transition(Trigger::MoveComplete);
        self.held_since_ms = Some(now_ms);
        if let Err(e) = self.driver.set_enabled(false) {
            return Err(self.fail_safe(&*e));
        }
        self.enabled = false;
        self.driver.set_current_position(0);
        debug!(steps, "move complete");
        Ok(MotionStatus::Completed { steps })
    }

    fn burst(&mut self, step: fn(&mut D, u32) -> DriverResult<u32>) -> Result<u32> {
        let max = self.kinematics.steps_per_tick.max(1);
        match step(&mut self.driver, max) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail_safe(&*e)),
        }
    }

    /// Advance pending motion by one bounded burst.
    pub fn tick(&mut self, now_ms: u64) -> Result<MotionStatus> {
        if !self.began {
            return Ok(MotionStatus::Idle);
        }
        match self.mode {
            PumpMode::Dosing if self.move_active => {
                if self.driver.distance_to_go() != 0 {
                    self.burst(D::run_toward_target)?;
                }
                let remaining = self.driver.distance_to_go();
                if remaining == 0 {
                    self.complete_move(now_ms)
                } else {
                    Ok(MotionStatus::Moving { remaining })
                }
            }
            PumpMode::Peristaltic if self.enabled && self.current_speed > 0.0 => {
                self.burst(D::run_at_speed)?;
                Ok(MotionStatus::Running)
            }
            _ => Ok(MotionStatus::Idle),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn is_moving(&self) -> bool {
        match self.mode {
            PumpMode::Dosing => self.move_active,
            PumpMode::Peristaltic => self.enabled && self.current_speed > 0.0,
            PumpMode::Holding => false,
        }
    }

    /// Idle and past the hold delay of the last finished move.
    pub fn is_ready(&self, now_ms: u64) -> bool {
        !self.is_moving()
            && self
                .held_since_ms
                .is_none_or(|t| now_ms.saturating_sub(t) >= self.kinematics.hold_delay_ms)
    }

    pub fn mode(&self) -> PumpMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_position(&self) -> i64 {
        self.driver.current_position()
    }

    pub fn distance_to_go(&self) -> i64 {
        self.driver.distance_to_go()
    }

    pub fn speed(&self) -> f32 {
        self.current_speed
    }

    pub fn max_speed(&self) -> f32 {
        self.kinematics.max_speed
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kinematics
    }

    /// Steps of the most recently finished (or stopped) position move.
    pub fn last_completed_steps(&self) -> i64 {
        self.last_completed_steps
    }

    /// Calibration constant of the active mode.
    pub fn steps_per_ml(&self) -> f32 {
        self.calibration.for_mode(self.mode)
    }

    pub fn calibration(&self) -> PumpCalibration {
        self.calibration
    }

    pub fn dosing_steps_per_ml(&self) -> f32 {
        self.calibration.dosing_steps_per_ml
    }

    pub fn peristaltic_steps_per_ml(&self) -> f32 {
        self.calibration.peristaltic_steps_per_ml
    }

    pub fn set_dosing_steps_per_ml(&mut self, v: f32) {
        self.calibration.dosing_steps_per_ml = v;
    }

    pub fn set_peristaltic_steps_per_ml(&mut self, v: f32) {
        self.calibration.peristaltic_steps_per_ml = v;
    }

    pub fn set_steps_per_ml_for(&mut self, mode: PumpMode, v: f32) {
        self.calibration.set_for_mode(mode, v);
    }

    /// Volume per minute at the current speed; `0.0` when uncalibrated.
    pub fn flow_rate_ml_per_min(&self) -> f32 {
        let spm = self.calibration.for_mode(PumpMode::Peristaltic);
        if is_calibrated(spm) {
            self.current_speed / spm * 60.0
        } else {
            0.0
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    /// Set the run speed, clamped to `[0, max_speed]`. While running
    /// continuously the enable line follows `speed > 0`.
    pub fn set_speed(&mut self, steps_per_sec: f32) -> Result<()> {
        let speed = if steps_per_sec.is_nan() {
            0.0
        } else {
            steps_per_sec.clamp(0.0, self.kinematics.max_speed.max(0.0))
        };
        self.current_speed = speed;
        if !self.began {
            return Ok(());
        }
        self.driver.set_speed(speed);
        if self.mode == PumpMode::Peristaltic {
            self.write_enable(speed > 0.0)?;
        }
        Ok(())
    }

    pub fn set_max_speed(&mut self, steps_per_sec: f32) {
        self.kinematics.max_speed = steps_per_sec.max(0.0);
        self.current_speed = self.current_speed.min(self.kinematics.max_speed);
        if self.began {
            self.driver.set_max_speed(self.kinematics.max_speed);
        }
    }

    pub fn set_acceleration(&mut self, steps_per_sec2: f32) {
        self.kinematics.acceleration = steps_per_sec2;
        if self.began {
            self.driver.set_acceleration(steps_per_sec2);
        }
    }

    pub fn set_microsteps(&mut self, microsteps: u16) -> Result<()> {
        self.kinematics.microsteps = microsteps;
        if self.began {
            self.driver
                .set_microsteps(microsteps)
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
        }
        Ok(())
    }

    pub fn set_hold_delay(&mut self, ms: u64) {
        self.kinematics.hold_delay_ms = ms;
    }

    /// Redefine the logical position; any pending position move is dropped.
    pub fn set_current_position(&mut self, position: i64) {
        self.driver.set_current_position(position);
        self.move_origin = position;
        self.move_active = false;
    }
}
