use std::time::{Duration, Instant};

use pump_hardware::util::{
    MAX_STEP_LAG, StepPacer, ramp_floor, ramp_speed, step_interval, valid_microsteps,
};
use rstest::rstest;

#[rstest]
#[case(1, true)]
#[case(16, true)]
#[case(256, true)]
#[case(0, false)]
#[case(3, false)]
#[case(512, false)]
fn microstep_settings(#[case] microsteps: u16, #[case] ok: bool) {
    assert_eq!(valid_microsteps(microsteps), ok);
}

#[test]
fn interval_is_reciprocal_of_speed() {
    let us = |v: f32| step_interval(v).map(|d| d.as_micros());
    assert_eq!(us(1000.0), Some(1000));
    assert_eq!(us(-500.0), Some(2000));
    assert_eq!(step_interval(0.0), None);
    assert_eq!(step_interval(f32::NAN), None);
}

#[test]
fn ramp_accelerates_far_from_target() {
    let v = ramp_speed(100.0, 4000.0, 1000.0, 100_000, 0.1);
    assert!((v - 200.0).abs() < 1e-3);
    let capped = ramp_speed(3990.0, 4000.0, 1000.0, 1_000_000, 0.1);
    assert_eq!(capped, 4000.0);
}

#[test]
fn ramp_brakes_near_target_but_keeps_floor() {
    // braking distance at 1000 steps/s with 1000 steps/s^2 is 500 steps
    let v = ramp_speed(1000.0, 4000.0, 1000.0, 400, 0.1);
    assert!((v - 900.0).abs() < 1e-3);
    let slow = ramp_speed(10.0, 4000.0, 100.0, 0, 1.0);
    assert_eq!(slow, ramp_floor(100.0));
}

#[test]
fn pacer_catches_up_on_every_due_step() {
    let base = Instant::now();
    let mut pacer = StepPacer::default();
    assert_eq!(pacer.try_step(base, 2000.0), Some(Duration::ZERO));

    // 1 ms at 2000 steps/s leaves two steps due.
    let later = base + Duration::from_millis(1);
    let granted = std::iter::from_fn(|| pacer.try_step(later, 2000.0)).count();
    assert_eq!(granted, 2);
    assert_eq!(pacer.try_step(later, 2000.0), None);
}

#[test]
fn pacer_drops_backlog_older_than_max_lag() {
    let base = Instant::now();
    let mut pacer = StepPacer::default();
    pacer.try_step(base, 2000.0);

    let stalled = base + MAX_STEP_LAG * 50;
    assert_eq!(pacer.try_step(stalled, 2000.0), Some(Duration::from_micros(500)));
    assert_eq!(pacer.try_step(stalled, 2000.0), None);
}

#[test]
fn pacer_idles_at_zero_speed_and_restarts_after_reset() {
    let base = Instant::now();
    let mut pacer = StepPacer::default();
    assert_eq!(pacer.try_step(base, 0.0), None);
    pacer.try_step(base, 1000.0);
    pacer.reset();
    assert_eq!(pacer.try_step(base, 1000.0), Some(Duration::ZERO));
}
