//! Steps-per-mL calibration as a polled sub-state machine.
//!
//! `Idle -> Moving -> AwaitingVolume -> Idle`, with `Failed` as a terminal
//! state that the next [`CalibrationSession::start`] clears. Nothing in here
//! blocks; the control loop calls [`CalibrationSession::poll`] every iteration.

use pump_traits::{StepperDriver, Store};
use tracing::{info, warn};

use crate::config::CalibrationRun;
use crate::error::{CalibrationError, Result};
use crate::persist;
use crate::pump::{PumpController, PumpMode};

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationState {
    Idle,
    Moving {
        started_ms: u64,
        last_progress_ms: u64,
        last_position: i64,
    },
    AwaitingVolume {
        moved: i64,
    },
    Failed(CalibrationError),
}

/// What a single [`CalibrationSession::poll`] observed.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    Idle,
    Progress { moved: i64, target: i64 },
    /// The fixed move finished; waiting for the measured volume.
    AwaitingVolume { moved: i64 },
    Failed(CalibrationError),
}

/// Result of [`CalibrationSession::confirm`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub mode: PumpMode,
    pub measured_ml: f32,
    pub previous_steps_per_ml: f32,
    pub steps_per_ml: f32,
    /// `false` when the measurement was rejected and the previous value kept.
    pub updated: bool,
}

#[derive(Debug, Clone)]
pub struct CalibrationSession {
    run: CalibrationRun,
    state: CalibrationState,
}

impl CalibrationSession {
    pub fn new(run: CalibrationRun) -> Self {
        Self {
            run,
            state: CalibrationState::Idle,
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn run(&self) -> &CalibrationRun {
        &self.run
    }

    /// True while the fixed move is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self.state, CalibrationState::Moving { .. })
    }

    /// Stop the pump, zero the position and issue the fixed relative move in
    /// Dosing mode.
    pub fn start<D: StepperDriver>(
        &mut self,
        pump: &mut PumpController<D>,
        target_mode: PumpMode,
        fixed_steps: i64,
        speed: f32,
        now_ms: u64,
    ) -> Result<()> {
        if self.is_active() {
            return Err(eyre::Report::new(CalibrationError::AlreadyRunning));
        }
        pump.stop();
        pump.set_current_position(0);
        pump.set_mode(PumpMode::Dosing);
        pump.set_speed(speed)?;
        pump.move_relative(fixed_steps)?;

        self.run.target_mode = target_mode;
        self.run.fixed_steps = fixed_steps;
        self.run.speed = speed;
        self.state = CalibrationState::Moving {
            started_ms: now_ms,
            last_progress_ms: now_ms,
            last_position: 0,
        };
        info!(mode = %target_mode, fixed_steps, speed, "calibration started");
        Ok(())
    }

    /// Start with the configured run parameters.
    pub fn start_default<D: StepperDriver>(
        &mut self,
        pump: &mut PumpController<D>,
        now_ms: u64,
    ) -> Result<()> {
        let run = self.run;
        self.start(pump, run.target_mode, run.fixed_steps, run.speed, now_ms)
    }

    /// Track progress of the fixed move.
    pub fn poll<D: StepperDriver>(
        &mut self,
        pump: &mut PumpController<D>,
        now_ms: u64,
    ) -> CalibrationEvent {
        let target = self.run.fixed_steps;
        let (started_ms, mut last_progress_ms, last_position) = match self.state {
            CalibrationState::Moving {
                started_ms,
                last_progress_ms,
                last_position,
            } => (started_ms, last_progress_ms, last_position),
            CalibrationState::Idle => return CalibrationEvent::Idle,
            CalibrationState::AwaitingVolume { moved } => {
                return CalibrationEvent::AwaitingVolume { moved };
            }
            CalibrationState::Failed(ref e) => return CalibrationEvent::Failed(e.clone()),
        };

        let moved = if pump.is_moving() {
            pump.current_position()
        } else {
            pump.last_completed_steps()
        };
        if moved >= target {
            pump.stop();
            self.state = CalibrationState::AwaitingVolume { moved };
            info!(moved, target, "calibration move finished; measure the volume");
            return CalibrationEvent::AwaitingVolume { moved };
        }

        if moved != last_position {
            last_progress_ms = now_ms;
        }
        let stalled = now_ms.saturating_sub(last_progress_ms) > self.run.stall_ms;
        let timed_out = now_ms.saturating_sub(started_ms) >= self.run.timeout_ms;
        if stalled || timed_out {
            pump.stop();
            let err = if timed_out {
                CalibrationError::TimedOut { moved, target }
            } else {
                CalibrationError::Stalled { moved, target }
            };
            warn!(moved, target, error = %err, "calibration incomplete; keeping previous value");
            self.state = CalibrationState::Failed(err.clone());
            return CalibrationEvent::Failed(err);
        }

        self.state = CalibrationState::Moving {
            started_ms,
            last_progress_ms,
            last_position: moved,
        };
        CalibrationEvent::Progress { moved, target }
    }

    /// Cancel a calibration that is moving or waiting for its volume. The
    /// session ends in `Failed(Aborted)`; without a run in progress it is
    /// reset to Idle.
    pub fn abort<D: StepperDriver>(&mut self, pump: &mut PumpController<D>) {
        match self.state {
            CalibrationState::Moving { .. } | CalibrationState::AwaitingVolume { .. } => {
                if self.is_active() {
                    pump.stop();
                }
                info!("calibration aborted");
                self.state = CalibrationState::Failed(CalibrationError::Aborted);
            }
            CalibrationState::Idle | CalibrationState::Failed(_) => {
                self.state = CalibrationState::Idle;
            }
        }
    }

    /// Derive `fixed_steps / ml` for the target mode and persist it. A
    /// non-positive measurement keeps the previous constant.
    pub fn confirm<D: StepperDriver>(
        &mut self,
        ml: f32,
        pump: &mut PumpController<D>,
        store: &mut dyn Store,
    ) -> Result<CalibrationOutcome> {
        if !matches!(self.state, CalibrationState::AwaitingVolume { .. }) {
            return Err(eyre::Report::new(CalibrationError::NotAwaitingVolume));
        }
        let mode = self.run.target_mode;
        let previous = pump.calibration().for_mode(mode);
        let updated = ml.is_finite() && ml > 0.0;
        let steps_per_ml = if updated {
            self.run.fixed_steps as f32 / ml
        } else {
            warn!(ml, "measured volume must be > 0; keeping previous calibration");
            previous
        };

        pump.set_steps_per_ml_for(mode, steps_per_ml);
        persist::save_calibration(store, &pump.calibration());
        persist::commit(store)?;
        self.state = CalibrationState::Idle;

        info!(
            mode = %mode,
            measured_ml = ml,
            fixed_steps = self.run.fixed_steps,
            steps_per_ml,
            "calibration saved"
        );
        Ok(CalibrationOutcome {
            mode,
            measured_ml: ml,
            previous_steps_per_ml: previous,
            steps_per_ml,
            updated,
        })
    }
}
