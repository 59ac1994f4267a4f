//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "pump", version, about = "Stepper pump controller")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/pump_config.toml")]
    pub config: PathBuf,

    /// Emit JSON lines (logs and command output) instead of pretty text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Use the simulated stepper even when built with hardware support
    #[arg(long, action = ArgAction::SetTrue)]
    pub sim: bool,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Calibration target exposed on the command line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CalibrationMode {
    Dosing,
    Peristaltic,
}

impl From<CalibrationMode> for pump_core::PumpMode {
    fn from(m: CalibrationMode) -> Self {
        match m {
            CalibrationMode::Dosing => pump_core::PumpMode::Dosing,
            CalibrationMode::Peristaltic => pump_core::PumpMode::Peristaltic,
        }
    }
}

/// Output format for the timetable.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum ScheduleFormat {
    #[default]
    Text,
    Csv,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control loop (auto dosing, restored continuous run) until Ctrl-C
    Run,
    /// Dispense a volume right now in Dosing mode
    Dose {
        /// Volume in mL
        #[arg(long)]
        ml: f32,
        /// Give up if the move has not finished after this long
        #[arg(long, value_name = "MS", default_value_t = 600_000)]
        timeout_ms: u64,
    },
    /// Run continuously in Peristaltic mode until Ctrl-C
    Continuous {
        /// Speed in steps/s; defaults to the last saved speed
        #[arg(long)]
        speed: Option<f32>,
    },
    /// Stop the pump and remember it as stopped
    Stop,
    /// Run the fixed calibration move, then record the measured volume
    Calibrate {
        /// Which steps-per-mL constant to update
        #[arg(long, value_enum, default_value_t = CalibrationMode::Dosing)]
        mode: CalibrationMode,
        /// Measured volume in mL; prompted on stdin when omitted
        #[arg(long, value_name = "ML")]
        measured_ml: Option<f32>,
    },
    /// Print the weighted daily timetable
    Schedule {
        #[arg(long, value_enum, default_value_t = ScheduleFormat::Text)]
        format: ScheduleFormat,
    },
    /// Print scheduler state and calibration
    Status,
    /// Turn automatic dosing on
    Enable,
    /// Turn automatic dosing off
    Disable,
    /// Set the total daily volume for automatic dosing
    SetVolume {
        /// Volume in mL (0 disables dispensing without disabling the schedule)
        #[arg(long)]
        ml: f32,
    },
    /// Set the day/night split of the daily volume
    Split {
        /// Fraction dispensed during the day window, e.g. 0.7
        #[arg(long)]
        day: f32,
        /// Fraction dispensed outside the day window, e.g. 0.3
        #[arg(long)]
        night: f32,
    },
}
