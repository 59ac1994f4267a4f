use std::sync::atomic::AtomicBool;
use std::time::Duration;

use pump_core::error::{BuildError, CalibrationError, PumpError};
use pump_core::mocks::{MemoryStore, RecordingSink};
use pump_core::persist::keys;
use pump_core::{
    CalibrationEvent, CalibrationRun, CalibrationState, ControlLoop, ControlLoopBuilder,
    DoseOutcome, Kinematics, MotionStatus, PumpCalibration, PumpMode, ScheduleSettings,
};
use pump_hardware::{SimHandle, SimulatedStepper};
use pump_traits::{ManualClock, ManualWallClock, Store, StoreValue};
use rstest::rstest;

// 2024-03-10T00:00:00Z
const DAY0: u32 = 1_710_028_800;
const H: u32 = 3600;
const TICK: Duration = Duration::from_millis(5);

struct Rig {
    lp: ControlLoop<SimulatedStepper, MemoryStore>,
    sim: SimHandle,
    clock: ManualClock,
    wall: ManualWallClock,
    sink: RecordingSink,
}

fn builder(
    store: MemoryStore,
) -> (
    ControlLoopBuilder<SimulatedStepper, MemoryStore>,
    SimHandle,
    ManualClock,
    ManualWallClock,
    RecordingSink,
) {
    let driver = SimulatedStepper::new();
    let sim = driver.handle();
    let clock = ManualClock::new();
    let wall = ManualWallClock::new(Some(DAY0 + 12 * H + 10));
    let sink = RecordingSink::default();
    let b = ControlLoopBuilder::new()
        .with_calibration_run(CalibrationRun {
            fixed_steps: 1_000,
            ..CalibrationRun::default()
        })
        .with_clock(Box::new(clock.clone()))
        .with_wall_clock(Box::new(wall.clone()))
        .with_sink(Box::new(sink.clone()))
        .with_driver(driver)
        .with_store(store);
    (b, sim, clock, wall, sink)
}

fn rig(store: MemoryStore) -> Rig {
    let (b, sim, clock, wall, sink) = builder(store);
    Rig {
        lp: b.build().unwrap(),
        sim,
        clock,
        wall,
        sink,
    }
}

#[test]
fn build_starts_pump_held_and_disabled() {
    let r = rig(MemoryStore::default());
    let pump = r.lp.pump();
    assert_eq!(pump.mode(), PumpMode::Holding);
    assert!(!pump.is_enabled());
    assert!(!r.sim.enabled());
    assert_eq!(r.sim.microsteps(), 256);
    assert_eq!(pump.speed(), 2000.0);
    assert_eq!(pump.calibration(), PumpCalibration::default());
    assert!(!r.lp.doser().is_enabled());
}

#[test]
fn build_resumes_saved_continuous_run() {
    let mut store = MemoryStore::default();
    store.put(keys::SAVED_SPEED, StoreValue::F32(1200.0));
    store.put(keys::MODE, StoreValue::U8(PumpMode::Peristaltic.code()));
    store.put(keys::DOSING_STEPS_PER_ML, StoreValue::F32(500.0));
    let mut r = rig(store);

    assert_eq!(r.lp.pump().mode(), PumpMode::Peristaltic);
    assert!(r.lp.pump().is_moving());
    assert_eq!(r.lp.pump().speed(), 1200.0);
    assert_eq!(r.lp.pump().calibration().dosing_steps_per_ml, 500.0);

    let tick = r.lp.poll().unwrap();
    assert_eq!(tick.motion, MotionStatus::Running);
    assert_eq!(r.sim.position(), 16);
}

#[rstest]
#[case::holding(PumpMode::Holding, 1200.0)]
#[case::stopped(PumpMode::Peristaltic, 0.0)]
fn build_does_not_resume_without_a_running_peristaltic_save(
    #[case] mode: PumpMode,
    #[case] speed: f32,
) {
    let mut store = MemoryStore::default();
    store.put(keys::SAVED_SPEED, StoreValue::F32(speed));
    store.put(keys::MODE, StoreValue::U8(mode.code()));
    let r = rig(store);
    assert!(!r.lp.pump().is_moving());
    assert!(!r.sim.enabled());
}

#[test]
fn corrupt_stored_calibration_is_replaced() {
    let mut store = MemoryStore::default();
    store.put(keys::DOSING_STEPS_PER_ML, StoreValue::F32(f32::NAN));
    store.put(keys::PERISTALTIC_STEPS_PER_ML, StoreValue::F32(-3.0));
    let (b, ..) = builder(store);
    let lp = b
        .with_calibration(PumpCalibration {
            dosing_steps_per_ml: 800.0,
            peristaltic_steps_per_ml: 900.0,
        })
        .build()
        .unwrap();
    assert_eq!(lp.pump().calibration(), PumpCalibration::default());
}

#[test]
fn missing_stored_calibration_uses_configured_fallback() {
    let (b, ..) = builder(MemoryStore::default());
    let cal = PumpCalibration {
        dosing_steps_per_ml: 800.0,
        peristaltic_steps_per_ml: 900.0,
    };
    let lp = b.with_calibration(cal).build().unwrap();
    assert_eq!(lp.pump().calibration(), cal);
}

#[rstest]
#[case::zero_tick(Kinematics { steps_per_tick: 0, ..Kinematics::default() })]
#[case::zero_speed(Kinematics { max_speed: 0.0, ..Kinematics::default() })]
fn build_rejects_invalid_kinematics(#[case] kinematics: Kinematics) {
    let (b, ..) = builder(MemoryStore::default());
    let err = b.with_kinematics(kinematics).build().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(_))
    ));
}

#[rstest]
#[case::split_over_one(ScheduleSettings { day_ratio: 0.8, night_ratio: 0.4, ..ScheduleSettings::default() })]
#[case::empty_window(ScheduleSettings { day_start_hour: 12, day_end_hour: 12, ..ScheduleSettings::default() })]
#[case::odd_cadence(ScheduleSettings { doses_per_hour: 7, ..ScheduleSettings::default() })]
fn build_rejects_invalid_schedule(#[case] schedule: ScheduleSettings) {
    let (b, ..) = builder(MemoryStore::default());
    let err = b.with_schedule(schedule).build().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(_))
    ));
}

#[test]
fn build_from_config_applies_every_section() {
    let cfg = pump_config::load_toml(
        r#"
[pins]
step = 1
dir = 2

[motor]
steps_per_tick = 64

[schedule]
default_daily_volume_ml = 12.0
"#,
    )
    .unwrap();
    let (b, ..) = builder(MemoryStore::default());
    let lp = b.with_config(&cfg).build().unwrap();
    assert_eq!(lp.pump().kinematics().steps_per_tick, 64);
    assert_eq!(lp.doser().daily_volume(), 12.0);
}

#[test]
fn manual_dose_runs_to_completion_outside_the_ledger() {
    let mut r = rig(MemoryStore::default());
    assert_eq!(r.lp.dose_now(1.0).unwrap(), 709);
    assert!(r.sink.contains("Dosing 1.00 mL (709 steps)"));

    let iterations = r.lp.run_until_idle(TICK, 1_000).unwrap();
    assert_eq!(iterations, 45);
    assert!(r.sink.contains("Dose complete (709 steps)"));
    assert_eq!(r.sim.position(), 0);
    assert_eq!(r.sim.total_steps(), 709);
    assert!(!r.sim.enabled());
    assert_eq!(r.lp.doser().meta().total_dosed_volume, 0.0);
}

#[test]
fn run_until_idle_gives_up_on_a_stalled_motor() {
    let mut r = rig(MemoryStore::default());
    r.sim.set_stalled(true);
    r.lp.dose_now(1.0).unwrap();
    let err = r.lp.run_until_idle(TICK, 10).unwrap_err();
    assert!(matches!(err.downcast_ref::<PumpError>(), Some(PumpError::State(_))));
    assert!(!r.lp.pump().is_moving());
}

#[test]
fn auto_dose_flows_through_the_loop() {
    let mut r = rig(MemoryStore::default());
    r.lp.enable_auto_dosing().unwrap();

    let tick = r.lp.poll().unwrap();
    assert_eq!(
        tick.dose,
        Some(DoseOutcome::Seeded {
            next: DAY0 + 12 * H + 1800
        })
    );
    r.clock.advance(TICK);
    assert_eq!(r.lp.poll().unwrap().dose, Some(DoseOutcome::RateLimited));

    r.wall.set(Some(DAY0 + 12 * H + 1800));
    r.clock.advance(TICK);
    let tick = r.lp.poll().unwrap();
    assert!(
        matches!(tick.dose, Some(DoseOutcome::Dosed { steps: 310, .. })),
        "{tick:?}"
    );
    assert!(r.sink.contains("Auto dose 0.44 mL (310 steps)"));

    r.lp.run_until_idle(TICK, 1_000).unwrap();
    assert!(r.sink.contains("Dose complete (310 steps)"));
    assert_eq!(
        r.lp.store().get(keys::LAST_DOSING_TIME),
        Some(StoreValue::U32(DAY0 + 12 * H + 1800))
    );
}

#[test]
fn unsynchronized_wall_clock_blocks_auto_dosing() {
    let mut r = rig(MemoryStore::default());
    r.wall.set(None);
    r.lp.enable_auto_dosing().unwrap();
    assert_eq!(r.lp.now_epoch(), 0);
    assert_eq!(r.lp.poll().unwrap().dose, Some(DoseOutcome::ClockInvalid));
}

#[test]
fn new_day_is_reported() {
    let mut store = MemoryStore::default();
    store.put(keys::ENABLED, StoreValue::Bool(true));
    store.put(keys::LAST_DOSING_TIME, StoreValue::U32(DAY0 - 600));
    store.put(keys::TOTAL_DOSED_VOLUME, StoreValue::F32(20.0));
    let mut r = rig(store);
    let tick = r.lp.poll().unwrap();
    assert!(matches!(tick.dose, Some(DoseOutcome::NewDay { .. })), "{tick:?}");
    assert!(r.sink.contains("New day: dosing ledger reset"));
    assert_eq!(
        r.lp.store().get(keys::TOTAL_DOSED_VOLUME),
        Some(StoreValue::F32(0.0))
    );
}

#[test]
fn calibration_owns_the_pump_until_confirmed() {
    let mut r = rig(MemoryStore::default());
    r.lp.enable_auto_dosing().unwrap();
    r.lp.start_calibration(PumpMode::Dosing).unwrap();
    assert!(r.sink.contains("Calibrating dosing: 1000 steps"));

    let tick = r.lp.poll().unwrap();
    assert_eq!(
        tick.calibration,
        CalibrationEvent::Progress {
            moved: 16,
            target: 1_000
        }
    );
    assert_eq!(tick.dose, None);
    assert!(r.sink.contains("Calibrating... 16 of 1000 steps"));

    let mut polls = 1;
    loop {
        r.clock.advance(TICK);
        let tick = r.lp.poll().unwrap();
        polls += 1;
        assert_eq!(tick.dose, None);
        if let CalibrationEvent::AwaitingVolume { moved } = tick.calibration {
            assert_eq!(moved, 1_000);
            break;
        }
        assert!(polls < 100, "calibration never finished");
    }
    assert!(r.sink.contains("enter measured mL"));
    assert!(!r.sink.contains("Dose complete"));

    // Still parked while waiting for the measurement.
    r.clock.advance(TICK);
    assert_eq!(r.lp.poll().unwrap().dose, None);

    let out = r.lp.confirm_calibration(2.0).unwrap();
    assert!(out.updated);
    assert_eq!(out.previous_steps_per_ml, 709.22);
    assert_eq!(out.steps_per_ml, 500.0);
    assert_eq!(r.lp.pump().calibration().dosing_steps_per_ml, 500.0);
    assert_eq!(
        r.lp.store().get(keys::DOSING_STEPS_PER_ML),
        Some(StoreValue::F32(500.0))
    );
    assert!(r.sink.contains("New steps/mL: 500.00"));
    assert_eq!(r.lp.calibration().state(), &CalibrationState::Idle);

    // Scheduling resumes.
    r.clock.advance(TICK);
    assert!(r.lp.poll().unwrap().dose.is_some());
}

#[test]
fn stalled_calibration_fails_and_keeps_the_old_constant() {
    let mut r = rig(MemoryStore::default());
    r.sim.set_stalled(true);
    r.lp.start_calibration(PumpMode::Peristaltic).unwrap();

    let mut failed = None;
    for _ in 0..20 {
        r.clock.advance(Duration::from_millis(500));
        if let CalibrationEvent::Failed(e) = r.lp.poll().unwrap().calibration {
            failed = Some(e);
            break;
        }
    }
    assert_eq!(
        failed,
        Some(CalibrationError::Stalled {
            moved: 0,
            target: 1_000
        })
    );
    assert!(r.sink.contains("Calibration failed!"));
    assert!(!r.lp.pump().is_moving());
    assert_eq!(r.lp.pump().mode(), PumpMode::Holding);

    let err = r.lp.confirm_calibration(2.0).unwrap_err();
    assert_eq!(
        err.downcast_ref::<CalibrationError>(),
        Some(&CalibrationError::NotAwaitingVolume)
    );
    assert_eq!(r.lp.pump().calibration(), PumpCalibration::default());
}

#[test]
fn second_calibration_start_is_rejected_while_moving() {
    let mut r = rig(MemoryStore::default());
    r.lp.start_calibration(PumpMode::Dosing).unwrap();
    let err = r.lp.start_calibration(PumpMode::Dosing).unwrap_err();
    assert_eq!(
        err.downcast_ref::<CalibrationError>(),
        Some(&CalibrationError::AlreadyRunning)
    );
    r.lp.abort_calibration();
    assert!(!r.lp.pump().is_moving());
    assert_eq!(
        r.lp.calibration().state(),
        &CalibrationState::Failed(CalibrationError::Aborted)
    );
    assert!(r.sink.contains("Calibration aborted"));
    assert!(r.lp.dose_now(0.5).is_ok());
}

#[test]
fn driver_fault_stops_the_pump() {
    let mut r = rig(MemoryStore::default());
    r.lp.dose_now(1.0).unwrap();
    r.lp.poll().unwrap();
    r.sim.set_fail(true);
    let err = r.lp.poll().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PumpError>(),
        Some(PumpError::Hardware(_) | PumpError::HardwareFault(_))
    ));
    assert!(r.sink.contains("Pump fault:"));
    assert_eq!(r.lp.pump().mode(), PumpMode::Holding);
    assert!(!r.lp.pump().is_enabled());
    assert_eq!(r.lp.pump().last_completed_steps(), 16);
}

#[test]
fn continuous_run_and_stop_are_persisted() {
    let mut r = rig(MemoryStore::default());
    r.lp.start_continuous(1500.0).unwrap();
    assert_eq!(
        r.lp.store().get(keys::MODE),
        Some(StoreValue::U8(PumpMode::Peristaltic.code()))
    );
    assert_eq!(
        r.lp.store().get(keys::SAVED_SPEED),
        Some(StoreValue::F32(1500.0))
    );
    assert_eq!(r.lp.poll().unwrap().motion, MotionStatus::Running);

    r.lp.stop_pump();
    assert!(!r.lp.pump().is_moving());
    assert_eq!(
        r.lp.store().get(keys::MODE),
        Some(StoreValue::U8(PumpMode::Holding.code()))
    );
    assert_eq!(
        r.lp.store().get(keys::SAVED_SPEED),
        Some(StoreValue::F32(1500.0))
    );

    // A restart from this store stays stopped.
    let r2 = rig(r.lp.into_store());
    assert!(!r2.lp.pump().is_moving());
    assert_eq!(r2.lp.pump().speed(), 1500.0);
}

#[test]
fn run_exits_on_shutdown_and_stops_the_pump() {
    let mut r = rig(MemoryStore::default());
    r.lp.start_continuous(1000.0).unwrap();
    let shutdown = AtomicBool::new(true);
    r.lp.run(&shutdown, TICK);
    assert!(!r.lp.pump().is_moving());
    assert!(!r.sim.enabled());
}

#[test]
fn settings_commands_update_status_lines() {
    let mut r = rig(MemoryStore::default());
    r.lp.set_daily_volume(48.0).unwrap();
    r.lp.set_split(0.5, 0.25).unwrap();
    r.lp.log_status();
    assert!(r.sink.contains("Daily volume: 48.00 mL"));
    assert!(r.sink.contains("Day/night: 24.00/12.00 mL (11-23)"));
    r.lp.log_schedule();
    assert!(r.sink.contains("Schedule: 48 slots, 48.00 mL/day"));

    assert!(r.lp.set_split(0.8, 0.5).is_err());
    assert!(r.lp.set_daily_volume(f32::NAN).is_err());
    assert_eq!(r.lp.doser().daily_volume(), 48.0);
}
