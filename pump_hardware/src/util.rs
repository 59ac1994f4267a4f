use std::time::{Duration, Instant};

/// Largest backlog of missed step deadlines a pacer will catch up on.
pub const MAX_STEP_LAG: Duration = Duration::from_millis(20);

/// Driver microstep settings are powers of two up to 256.
#[inline]
pub fn valid_microsteps(microsteps: u16) -> bool {
    microsteps.is_power_of_two() && microsteps <= 256
}

/// Time between two step pulses at `steps_per_sec`; `None` when stopped.
pub fn step_interval(steps_per_sec: f32) -> Option<Duration> {
    let v = steps_per_sec.abs();
    if !v.is_finite() || v < f32::EPSILON {
        return None;
    }
    Some(Duration::from_secs_f64(1.0 / f64::from(v)))
}

/// Lowest speed of a ramp; the first step of a move is taken at this rate.
#[inline]
pub fn ramp_floor(accel: f32) -> f32 {
    accel.max(0.0).sqrt().max(1.0)
}

/// Trapezoidal speed profile for a position move.
///
/// Accelerates toward `max` by `accel * dt`, and decelerates once the
/// remaining distance is within the braking distance `v^2 / (2 a)`. Never
/// drops below [`ramp_floor`] so a move always finishes.
pub fn ramp_speed(current: f32, max: f32, accel: f32, remaining: i64, dt_secs: f32) -> f32 {
    let floor = ramp_floor(accel).min(max.max(1.0));
    if accel <= 0.0 {
        return max.max(floor);
    }
    let v = current.abs().max(floor);
    let braking = v * v / (2.0 * accel);
    let next = if (remaining.unsigned_abs() as f32) <= braking {
        v - accel * dt_secs
    } else {
        v + accel * dt_secs
    };
    next.clamp(floor, max.max(floor))
}

/// Fixed-rate step pacing across control-loop iterations.
///
/// Each granted step advances the deadline by exactly one interval, so a
/// caller that polls slower than the step rate still receives every step
/// that fell due in between. A backlog older than [`MAX_STEP_LAG`] is dropped
/// instead of being replayed as a burst.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepPacer {
    last: Option<Instant>,
}

impl StepPacer {
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Claim one step at `steps_per_sec` if it is due at `now`. Returns the
    /// interval since the previous step deadline, or `None` when nothing is
    /// due (or the speed is zero).
    pub fn try_step(&mut self, now: Instant, steps_per_sec: f32) -> Option<Duration> {
        let interval = step_interval(steps_per_sec)?;
        let Some(last) = self.last else {
            self.last = Some(now);
            return Some(Duration::ZERO);
        };
        let deadline = last + interval;
        if now < deadline {
            return None;
        }
        self.last = Some(if now.duration_since(deadline) > MAX_STEP_LAG {
            now
        } else {
            deadline
        });
        Some(interval)
    }
}
