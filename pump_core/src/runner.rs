//! Cooperative control loop and its type-state builder.
//!
//! `ControlLoop` owns every component (pump, scheduler, calibration session,
//! store, status sink, clocks). One [`ControlLoop::poll`] performs a bounded
//! amount of work: a motion burst, a calibration check and a scheduling
//! decision. [`ControlLoop::run`] repeats that until a shutdown flag is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use pump_config::rules;
use pump_traits::{
    Clock, MonotonicClock, StatusSink, StepperDriver, Store, SystemWallClock, WallClock,
};
use tracing::{error, info, warn};

use crate::calibration::{
    CalibrationEvent, CalibrationOutcome, CalibrationSession, CalibrationState,
};
use crate::config::{CalibrationRun, Kinematics, PumpCalibration, ScheduleSettings};
use crate::error::{BuildError, PumpError, Result};
use crate::persist::{self, SavedMotion};
use crate::pump::{PumpController, PumpMode};
use crate::scheduler::{AutoDoser, DoseOutcome};
use crate::status::{MotionStatus, TracingSink};

/// Interval between calibration progress lines.
const PROGRESS_REPORT_MS: u64 = 1_000;

/// Everything one [`ControlLoop::poll`] observed.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopTick {
    pub motion: MotionStatus,
    pub calibration: CalibrationEvent,
    /// `None` while a calibration owns the pump.
    pub dose: Option<DoseOutcome>,
}

pub struct ControlLoop<D: StepperDriver, S: Store> {
    pump: PumpController<D>,
    doser: AutoDoser,
    calibration: CalibrationSession,
    store: S,
    sink: Box<dyn StatusSink>,
    clock: Arc<dyn Clock + Send + Sync>,
    wall: Box<dyn WallClock>,
    epoch: Instant,
    last_progress_line_ms: Option<u64>,
}

impl<D: StepperDriver, S: Store> core::fmt::Debug for ControlLoop<D, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("pump", &self.pump)
            .field("doser", &self.doser)
            .field("calibration", self.calibration.state())
            .finish()
    }
}

impl<D: StepperDriver, S: Store> ControlLoop<D, S> {
    pub fn now_ms(&self) -> u64 {
        self.clock.ms_since(self.epoch)
    }

    /// Wall-clock seconds; `0` while unsynchronized (which the scheduler treats
    /// as an invalid clock).
    pub fn now_epoch(&self) -> u32 {
        self.wall.epoch_secs().unwrap_or(0)
    }

    fn show(&mut self, line: &str) {
        self.sink.show(line);
    }

    /// One bounded iteration.
    pub fn poll(&mut self) -> Result<LoopTick> {
        let now_ms = self.now_ms();
        let motion = match self.pump.tick(now_ms) {
            Ok(m) => m,
            Err(e) => {
                self.show(&format!("Pump fault: {e}"));
                return Err(e);
            }
        };
        if let MotionStatus::Completed { steps } = motion {
            if !self.calibration.is_active() {
                self.show(&format!("Dose complete ({steps} steps)"));
            }
        }

        let calibration = self.poll_calibration(now_ms);
        let dose = if self.calibration_owns_pump() {
            None
        } else {
            let now = self.now_epoch();
            let outcome = self
                .doser
                .check_and_dose(now, now_ms, &mut self.pump, &mut self.store)?;
            self.report_dose(&outcome);
            Some(outcome)
        };

        Ok(LoopTick {
            motion,
            calibration,
            dose,
        })
    }

    fn calibration_owns_pump(&self) -> bool {
        matches!(
            self.calibration.state(),
            CalibrationState::Moving { .. } | CalibrationState::AwaitingVolume { .. }
        )
    }

    fn poll_calibration(&mut self, now_ms: u64) -> CalibrationEvent {
        let was_moving = self.calibration.is_active();
        let event = self.calibration.poll(&mut self.pump, now_ms);
        if !was_moving {
            return event;
        }
        match &event {
            CalibrationEvent::Progress { moved, target } => {
                let due = self
                    .last_progress_line_ms
                    .is_none_or(|t| now_ms.saturating_sub(t) >= PROGRESS_REPORT_MS);
                if due {
                    self.last_progress_line_ms = Some(now_ms);
                    self.show(&format!("Calibrating... {moved} of {target} steps"));
                }
            }
            CalibrationEvent::AwaitingVolume { moved } => {
                self.show(&format!(
                    "Calibration move done ({moved} steps); enter measured mL"
                ));
            }
            CalibrationEvent::Failed(e) => {
                self.show(&format!("Calibration failed! {e}"));
            }
            CalibrationEvent::Idle => {}
        }
        event
    }

    fn report_dose(&mut self, outcome: &DoseOutcome) {
        match outcome {
            DoseOutcome::Dosed {
                volume_ml, steps, ..
            } => self.show(&format!("Auto dose {volume_ml:.2} mL ({steps} steps)")),
            DoseOutcome::Skipped { reason, .. } => {
                self.show(&format!("Dose skipped: {reason}"));
            }
            DoseOutcome::NewDay { .. } => self.show("New day: dosing ledger reset"),
            _ => {}
        }
    }

    /// Poll until `shutdown` is set, sleeping `period` between iterations.
    /// Iteration errors are logged and fail the pump toward stopped; the loop
    /// keeps running.
    pub fn run(&mut self, shutdown: &AtomicBool, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "control loop running");
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll() {
                error!(error = %e, "control loop iteration failed");
                self.pump.stop();
            }
            self.clock.sleep(period);
        }
        self.pump.stop();
        info!("control loop stopped");
    }

    /// Poll until the pump is idle and no calibration move is in flight.
    /// Returns the number of iterations, or an error after `max_iterations`.
    pub fn run_until_idle(&mut self, period: Duration, max_iterations: usize) -> Result<usize> {
        for i in 0..max_iterations {
            self.poll()?;
            if !(self.pump.is_moving() || self.calibration.is_active()) {
                return Ok(i + 1);
            }
            self.clock.sleep(period);
        }
        self.pump.stop();
        Err(eyre::Report::new(PumpError::State(format!(
            "pump still busy after {max_iterations} iterations"
        ))))
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Manual dose in Dosing mode. Not counted in the scheduler ledger.
    pub fn dose_now(&mut self, ml: f32) -> Result<i64> {
        if self.calibration_owns_pump() {
            return Err(eyre::Report::new(PumpError::State(
                "calibration in progress".into(),
            )));
        }
        self.pump.set_mode(PumpMode::Dosing);
        let steps = self.pump.move_by_volume(ml)?;
        if steps == 0 {
            self.show(&format!("Dose of {ml:.2} mL not started (0 steps)"));
        } else {
            self.show(&format!("Dosing {ml:.2} mL ({steps} steps)"));
        }
        Ok(steps)
    }

    fn save_motion(&mut self, speed: f32) {
        persist::save_motion(
            &mut self.store,
            SavedMotion {
                speed,
                mode: self.pump.mode(),
            },
        );
        if let Err(e) = persist::commit(&mut self.store) {
            warn!(error = %e, "could not persist pump motion");
        }
    }

    /// Run continuously at `speed` and remember it across restarts.
    pub fn start_continuous(&mut self, speed: f32) -> Result<()> {
        self.pump.set_speed(speed)?;
        self.pump.run_continuous()?;
        let speed = self.pump.speed();
        self.save_motion(speed);
        self.show(&format!(
            "Running at {speed:.0} steps/s ({:.2} mL/min)",
            self.pump.flow_rate_ml_per_min()
        ));
        Ok(())
    }

    /// Stop the pump; the last speed is kept for the next continuous run.
    pub fn stop_pump(&mut self) {
        let speed = self.pump.speed();
        self.pump.stop();
        self.save_motion(speed);
        self.show("Pump stopped");
    }

    pub fn start_calibration(&mut self, target_mode: PumpMode) -> Result<()> {
        let run = *self.calibration.run();
        let now_ms = self.now_ms();
        self.calibration
            .start(&mut self.pump, target_mode, run.fixed_steps, run.speed, now_ms)?;
        self.last_progress_line_ms = None;
        self.show(&format!("Calibrating {target_mode}: {} steps", run.fixed_steps));
        Ok(())
    }

    pub fn confirm_calibration(&mut self, ml: f32) -> Result<CalibrationOutcome> {
        let out = self
            .calibration
            .confirm(ml, &mut self.pump, &mut self.store)?;
        if out.updated {
            self.show(&format!("New steps/mL: {:.2}", out.steps_per_ml));
        } else {
            self.show(&format!(
                "Measured volume rejected; keeping {:.2} steps/mL",
                out.steps_per_ml
            ));
        }
        Ok(out)
    }

    pub fn abort_calibration(&mut self) {
        self.calibration.abort(&mut self.pump);
        self.show("Calibration aborted");
    }

    pub fn enable_auto_dosing(&mut self) -> Result<()> {
        self.doser.enable(&mut self.store)?;
        self.show("Auto dosing enabled");
        Ok(())
    }

    pub fn disable_auto_dosing(&mut self) -> Result<()> {
        self.doser.disable(&mut self.store)?;
        self.show("Auto dosing disabled");
        Ok(())
    }

    pub fn set_daily_volume(&mut self, ml: f32) -> Result<()> {
        self.doser.set_daily_volume(ml, &mut self.store)?;
        self.show(&format!("Daily volume: {ml:.2} mL"));
        Ok(())
    }

    pub fn set_split(&mut self, day: f32, night: f32) -> Result<()> {
        self.doser.set_split(day, night, &mut self.store)?;
        self.show(&format!("Split: {:.0}% day / {:.0}% night", day * 100.0, night * 100.0));
        Ok(())
    }

    pub fn log_status(&mut self) {
        self.doser.log_status(self.sink.as_mut());
    }

    pub fn log_schedule(&mut self) {
        self.doser.log_schedule(self.sink.as_mut());
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn pump(&self) -> &PumpController<D> {
        &self.pump
    }

    pub fn pump_mut(&mut self) -> &mut PumpController<D> {
        &mut self.pump
    }

    pub fn doser(&self) -> &AutoDoser {
        &self.doser
    }

    pub fn calibration(&self) -> &CalibrationSession {
        &self.calibration
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Release the store, e.g. to inspect it after a dry run.
    pub fn into_store(self) -> S {
        self.store
    }
}

// ── Type-state builder ───────────────────────────────────────────────────────

/// Placeholder for a collaborator that has not been provided yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct Missing;

/// Builder for `ControlLoop`. `build()` is available once both a driver and a
/// store were supplied.
pub struct ControlLoopBuilder<D, S> {
    driver: D,
    store: S,
    calibration: PumpCalibration,
    kinematics: Kinematics,
    default_speed: f32,
    calibration_run: CalibrationRun,
    schedule: ScheduleSettings,
    clock: Option<Box<dyn Clock + Send + Sync>>,
    wall: Option<Box<dyn WallClock>>,
    sink: Option<Box<dyn StatusSink>>,
}

impl Default for ControlLoopBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            driver: Missing,
            store: Missing,
            calibration: PumpCalibration::default(),
            kinematics: Kinematics::default(),
            default_speed: 2000.0,
            calibration_run: CalibrationRun::default(),
            schedule: ScheduleSettings::default(),
            clock: None,
            wall: None,
            sink: None,
        }
    }
}

impl ControlLoopBuilder<Missing, Missing> {
    /// Start building a control loop.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Chainable setters that do not affect type-state.
impl<D, S> ControlLoopBuilder<D, S> {
    /// Apply every section of a validated config.
    pub fn with_config(mut self, cfg: &pump_config::Config) -> Self {
        self.calibration = PumpCalibration::from(&cfg.calibration);
        self.kinematics = Kinematics::from(&cfg.motor);
        self.default_speed = cfg.motor.default_speed;
        self.calibration_run = CalibrationRun::from(&cfg.calibration);
        self.schedule = ScheduleSettings::from(&cfg.schedule);
        self
    }
    /// Calibration used when the store holds none.
    pub fn with_calibration(mut self, calibration: PumpCalibration) -> Self {
        self.calibration = calibration;
        self
    }
    pub fn with_kinematics(mut self, kinematics: Kinematics) -> Self {
        self.kinematics = kinematics;
        self
    }
    pub fn with_default_speed(mut self, steps_per_sec: f32) -> Self {
        self.default_speed = steps_per_sec;
        self
    }
    pub fn with_calibration_run(mut self, run: CalibrationRun) -> Self {
        self.calibration_run = run;
        self
    }
    pub fn with_schedule(mut self, schedule: ScheduleSettings) -> Self {
        self.schedule = schedule;
        self
    }
    /// Monotonic clock; defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }
    /// Wall clock; defaults to `SystemWallClock`.
    pub fn with_wall_clock(mut self, wall: Box<dyn WallClock>) -> Self {
        self.wall = Some(wall);
        self
    }
    /// Status sink; defaults to `TracingSink`.
    pub fn with_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

// Setters that advance type-state
impl<D, S> ControlLoopBuilder<D, S> {
    pub fn with_driver<D2: StepperDriver>(self, driver: D2) -> ControlLoopBuilder<D2, S> {
        ControlLoopBuilder {
            driver,
            store: self.store,
            calibration: self.calibration,
            kinematics: self.kinematics,
            default_speed: self.default_speed,
            calibration_run: self.calibration_run,
            schedule: self.schedule,
            clock: self.clock,
            wall: self.wall,
            sink: self.sink,
        }
    }

    pub fn with_store<S2: Store>(self, store: S2) -> ControlLoopBuilder<D, S2> {
        ControlLoopBuilder {
            driver: self.driver,
            store,
            calibration: self.calibration,
            kinematics: self.kinematics,
            default_speed: self.default_speed,
            calibration_run: self.calibration_run,
            schedule: self.schedule,
            clock: self.clock,
            wall: self.wall,
            sink: self.sink,
        }
    }
}

fn invalid(msg: &'static str) -> eyre::Report {
    eyre::Report::new(BuildError::InvalidConfig(msg))
}

/// Checks the invariants the loop relies on, using the same rules as
/// `pump_config::Config::validate` for values supplied through the builder.
fn validate(
    kinematics: &Kinematics,
    schedule: &ScheduleSettings,
    run: &CalibrationRun,
) -> Result<()> {
    if !rules::positive_finite(kinematics.max_speed) {
        return Err(invalid("max_speed must be > 0"));
    }
    if kinematics.steps_per_tick == 0 {
        return Err(invalid("steps_per_tick must be >= 1"));
    }
    if !rules::doses_per_hour_ok(schedule.doses_per_hour) {
        return Err(invalid("doses_per_hour must divide 60"));
    }
    if !rules::day_window_ok(schedule.day_start_hour, schedule.day_end_hour) {
        return Err(invalid("day window must satisfy start < end <= 24"));
    }
    if !rules::split_ok(schedule.day_ratio, schedule.night_ratio) {
        return Err(invalid("day/night split must be fractions summing to <= 1"));
    }
    if !rules::utc_offset_ok(i64::from(schedule.utc_offset_secs)) {
        return Err(invalid("utc offset must be within +/-14h"));
    }
    if run.fixed_steps <= 0 {
        return Err(invalid("calibration fixed_steps must be > 0"));
    }
    Ok(())
}

impl<D: StepperDriver, S: Store> ControlLoopBuilder<D, S> {
    /// Validate, restore persisted state and start the pump.
    ///
    /// The pump resumes a continuous run only when it was last left running
    /// in Peristaltic mode with a positive speed.
    pub fn build(self) -> Result<ControlLoop<D, S>> {
        validate(&self.kinematics, &self.schedule, &self.calibration_run)?;

        let store = self.store;
        let calibration = persist::load_calibration(&store, self.calibration);
        let mut pump = PumpController::new(self.driver);
        pump.configure(calibration, self.kinematics);
        pump.begin()?;

        let motion = persist::load_motion(&store, self.default_speed);
        pump.set_speed(motion.speed)?;
        if motion.mode == PumpMode::Peristaltic && pump.speed() > 0.0 {
            pump.run_continuous()?;
        }

        let mut doser = AutoDoser::new(self.schedule);
        doser.load_state(&store);

        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(b) => Arc::from(b),
            None => Arc::new(MonotonicClock::new()),
        };
        let epoch = clock.now();

        info!(
            dosing_steps_per_ml = calibration.dosing_steps_per_ml,
            peristaltic_steps_per_ml = calibration.peristaltic_steps_per_ml,
            speed = pump.speed(),
            mode = %pump.mode(),
            auto = doser.is_enabled(),
            "control loop built"
        );

        Ok(ControlLoop {
            pump,
            doser,
            calibration: CalibrationSession::new(self.calibration_run),
            store,
            sink: self.sink.unwrap_or_else(|| Box::new(TracingSink)),
            clock,
            wall: self.wall.unwrap_or_else(|| Box::new(SystemWallClock)),
            epoch,
            last_progress_line_ms: None,
        })
    }
}
