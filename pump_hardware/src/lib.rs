pub mod error;
pub mod util;

#[cfg(feature = "hardware")]
pub mod gpio;

#[cfg(feature = "hardware")]
pub use gpio::GpioStepper;

use std::sync::{Arc, Mutex, MutexGuard};

use pump_traits::{DriverResult, StepperDriver};

use crate::error::HwError;

#[derive(Debug, Default)]
struct SimState {
    enabled: bool,
    microsteps: u16,
    max_speed: f32,
    acceleration: f32,
    speed: f32,
    position: i64,
    target: i64,
    total_steps: u64,
    stalled: bool,
    fail: bool,
}

/// Simulated stepper: steps complete instantly, bounded by `max_steps` per call.
///
/// A [`SimHandle`] observes and perturbs the same state, so a test can keep
/// one while the pump owns the driver.
#[derive(Debug, Default)]
pub struct SimulatedStepper {
    state: Arc<Mutex<SimState>>,
}

/// Shared view of a [`SimulatedStepper`].
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

impl SimulatedStepper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn check_fail(&self) -> DriverResult {
        if lock(&self.state).fail {
            return Err(Box::new(HwError::Fault("simulated driver failure".into())));
        }
        Ok(())
    }
}

impl SimHandle {
    pub fn enabled(&self) -> bool {
        lock(&self.state).enabled
    }
    pub fn microsteps(&self) -> u16 {
        lock(&self.state).microsteps
    }
    pub fn speed(&self) -> f32 {
        lock(&self.state).speed
    }
    pub fn max_speed(&self) -> f32 {
        lock(&self.state).max_speed
    }
    pub fn position(&self) -> i64 {
        lock(&self.state).position
    }
    /// Steps taken over the driver's lifetime, in either direction.
    pub fn total_steps(&self) -> u64 {
        lock(&self.state).total_steps
    }
    /// A stalled motor accepts commands but never moves.
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }
    /// Make every motion call fail.
    pub fn set_fail(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }
}

impl StepperDriver for SimulatedStepper {
    fn set_enabled(&mut self, enabled: bool) -> DriverResult {
        lock(&self.state).enabled = enabled;
        tracing::trace!(enabled, "sim enable line");
        Ok(())
    }

    fn set_microsteps(&mut self, microsteps: u16) -> DriverResult {
        if !util::valid_microsteps(microsteps) {
            return Err(Box::new(HwError::InvalidMicrosteps(microsteps)));
        }
        lock(&self.state).microsteps = microsteps;
        Ok(())
    }

    fn set_max_speed(&mut self, steps_per_sec: f32) {
        lock(&self.state).max_speed = steps_per_sec;
    }

    fn set_acceleration(&mut self, steps_per_sec2: f32) {
        lock(&self.state).acceleration = steps_per_sec2;
    }

    fn set_speed(&mut self, steps_per_sec: f32) {
        lock(&self.state).speed = steps_per_sec;
    }

    fn move_to(&mut self, target: i64) {
        lock(&self.state).target = target;
    }

    fn set_current_position(&mut self, position: i64) {
        let mut s = lock(&self.state);
        s.position = position;
        s.target = position;
    }

    fn current_position(&self) -> i64 {
        lock(&self.state).position
    }

    fn target_position(&self) -> i64 {
        lock(&self.state).target
    }

    fn run_toward_target(&mut self, max_steps: u32) -> DriverResult<u32> {
        self.check_fail()?;
        let mut s = lock(&self.state);
        if s.stalled || !s.enabled {
            return Ok(0);
        }
        let distance = s.target - s.position;
        let n = distance.unsigned_abs().min(u64::from(max_steps));
        s.position += distance.signum() * n as i64;
        s.total_steps += n;
        Ok(n as u32)
    }

    fn run_at_speed(&mut self, max_steps: u32) -> DriverResult<u32> {
        self.check_fail()?;
        let mut s = lock(&self.state);
        if s.stalled || !s.enabled || s.speed == 0.0 {
            return Ok(0);
        }
        let n = i64::from(max_steps);
        let dir = if s.speed > 0.0 { 1 } else { -1 };
        s.position += dir * n;
        s.target = s.position;
        s.total_steps += u64::from(max_steps);
        Ok(max_steps)
    }

    fn halt(&mut self) {
        let mut s = lock(&self.state);
        s.target = s.position;
        s.speed = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_are_bounded_per_call() {
        let mut sim = SimulatedStepper::new();
        let h = sim.handle();
        sim.set_enabled(true).unwrap();
        sim.move_to(-40);
        assert_eq!(sim.run_toward_target(16).unwrap(), 16);
        assert_eq!(h.position(), -16);
        assert_eq!(sim.distance_to_go(), -24);
        assert_eq!(sim.run_toward_target(100).unwrap(), 24);
        assert_eq!(sim.run_toward_target(100).unwrap(), 0);
        assert_eq!(h.total_steps(), 40);
    }

    #[test]
    fn disabled_or_stalled_motor_does_not_move() {
        let mut sim = SimulatedStepper::new();
        let h = sim.handle();
        sim.move_to(10);
        assert_eq!(sim.run_toward_target(16).unwrap(), 0);
        sim.set_enabled(true).unwrap();
        h.set_stalled(true);
        assert_eq!(sim.run_toward_target(16).unwrap(), 0);
        h.set_stalled(false);
        assert_eq!(sim.run_toward_target(16).unwrap(), 10);
    }

    #[test]
    fn halt_drops_pending_motion() {
        let mut sim = SimulatedStepper::new();
        sim.set_enabled(true).unwrap();
        sim.set_speed(-300.0);
        assert_eq!(sim.run_at_speed(8).unwrap(), 8);
        assert_eq!(sim.current_position(), -8);
        sim.move_to(100);
        sim.halt();
        assert_eq!(sim.distance_to_go(), 0);
        assert_eq!(sim.run_at_speed(8).unwrap(), 0);
    }

    #[test]
    fn rejects_bad_microsteps_and_injected_failures() {
        let mut sim = SimulatedStepper::new();
        assert!(sim.set_microsteps(3).is_err());
        sim.handle().set_fail(true);
        let err = sim.run_toward_target(1).unwrap_err();
        assert!(err.to_string().contains("simulated driver failure"));
    }
}
