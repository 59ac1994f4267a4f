//! STEP/DIR/EN stepper driver on Raspberry Pi GPIO (`rppal`).
//!
//! Steps are emitted only when due, so a call never sleeps longer than one
//! pulse width per step; steps that fell due since the previous call are
//! caught up to `max_steps`. Microstepping is configured on the driver board itself; the
//! value is only recorded here.

use std::time::{Duration, Instant};

use pump_traits::{DriverResult, StepperDriver};
use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, trace};

use crate::error::{HwError, Result};
use crate::util::{StepPacer, ramp_floor, ramp_speed, valid_microsteps};

/// High time of a step pulse.
const PULSE_WIDTH: Duration = Duration::from_micros(2);

pub struct GpioStepper {
    step: OutputPin,
    dir: OutputPin,
    /// Active low (TMC2209 style).
    enable: Option<OutputPin>,
    position: i64,
    target: i64,
    max_speed: f32,
    acceleration: f32,
    /// Constant speed for `run_at_speed`; sign is direction.
    speed: f32,
    /// Instantaneous speed of the current position move.
    ramp: f32,
    microsteps: u16,
    pacer: StepPacer,
    forward: Option<bool>,
}

impl GpioStepper {
    pub fn new(step_pin: u8, dir_pin: u8, enable_pin: Option<u8>) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        let output = |pin: u8| -> Result<OutputPin> {
            gpio.get(pin)
                .map(|p| p.into_output_low())
                .map_err(|e| HwError::Gpio(format!("pin {pin}: {e}")))
        };
        let step = output(step_pin)?;
        let dir = output(dir_pin)?;
        let enable = match enable_pin {
            Some(pin) => {
                let mut en = output(pin)?;
                en.set_high();
                Some(en)
            }
            None => None,
        };
        debug!(step_pin, dir_pin, ?enable_pin, "gpio stepper ready");
        Ok(Self {
            step,
            dir,
            enable,
            position: 0,
            target: 0,
            max_speed: 1.0,
            acceleration: 0.0,
            speed: 0.0,
            ramp: 0.0,
            microsteps: 1,
            pacer: StepPacer::default(),
            forward: None,
        })
    }

    pub fn microsteps(&self) -> u16 {
        self.microsteps
    }

    fn pulse(&mut self, forward: bool) {
        if self.forward != Some(forward) {
            if forward {
                self.dir.set_high();
            } else {
                self.dir.set_low();
            }
            self.forward = Some(forward);
        }
        self.step.set_high();
        std::thread::sleep(PULSE_WIDTH);
        self.step.set_low();
        self.position += if forward { 1 } else { -1 };
    }
}

impl StepperDriver for GpioStepper {
    fn set_enabled(&mut self, enabled: bool) -> DriverResult {
        if let Some(en) = self.enable.as_mut() {
            if enabled {
                en.set_low();
            } else {
                en.set_high();
            }
        }
        if !enabled {
            self.ramp = 0.0;
            self.pacer.reset();
        }
        trace!(enabled, "enable line");
        Ok(())
    }

    fn set_microsteps(&mut self, microsteps: u16) -> DriverResult {
        if !valid_microsteps(microsteps) {
            return Err(Box::new(HwError::InvalidMicrosteps(microsteps)));
        }
        self.microsteps = microsteps;
        Ok(())
    }

    fn set_max_speed(&mut self, steps_per_sec: f32) {
        self.max_speed = steps_per_sec.abs().max(1.0);
    }

    fn set_acceleration(&mut self, steps_per_sec2: f32) {
        self.acceleration = steps_per_sec2.max(0.0);
    }

    fn set_speed(&mut self, steps_per_sec: f32) {
        self.speed = steps_per_sec.clamp(-self.max_speed, self.max_speed);
    }

    fn move_to(&mut self, target: i64) {
        self.target = target;
    }

    fn set_current_position(&mut self, position: i64) {
        self.position = position;
        self.target = position;
        self.ramp = 0.0;
    }

    fn current_position(&self) -> i64 {
        self.position
    }

    fn target_position(&self) -> i64 {
        self.target
    }

    fn run_toward_target(&mut self, max_steps: u32) -> DriverResult<u32> {
        let mut taken = 0;
        while taken < max_steps {
            let remaining = self.target - self.position;
            if remaining == 0 {
                self.ramp = 0.0;
                break;
            }
            let speed = self.ramp.max(ramp_floor(self.acceleration));
            let Some(dt) = self.pacer.try_step(Instant::now(), speed) else {
                break;
            };
            self.pulse(remaining > 0);
            let left = remaining - remaining.signum();
            self.ramp = ramp_speed(
                speed,
                self.max_speed,
                self.acceleration,
                left,
                dt.as_secs_f32(),
            );
            taken += 1;
        }
        Ok(taken)
    }

    fn run_at_speed(&mut self, max_steps: u32) -> DriverResult<u32> {
        let mut taken = 0;
        while taken < max_steps {
            if self.pacer.try_step(Instant::now(), self.speed).is_none() {
                break;
            }
            self.pulse(self.speed > 0.0);
            self.target = self.position;
            taken += 1;
        }
        Ok(taken)
    }

    fn halt(&mut self) {
        self.target = self.position;
        self.speed = 0.0;
        self.ramp = 0.0;
    }
}
