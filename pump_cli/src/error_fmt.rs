//! Human-readable error descriptions and structured JSON error formatting.

use pump_core::error::{BuildError, CalibrationError, PumpError, ScheduleError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return match ce {
            CalibrationError::Stalled { moved, target } => format!(
                "What happened: Calibration move stalled after {moved} of {target} steps.\nLikely causes: Motor disabled, tubing pinched, or driver not powered.\nHow to fix: Check the driver supply and the EN wiring, then calibrate again."
            ),
            CalibrationError::TimedOut { moved, target } => format!(
                "What happened: Calibration did not finish in time ({moved} of {target} steps).\nLikely causes: Calibration speed too low for the fixed step count.\nHow to fix: Raise calibration.speed or calibration.timeout_ms in the config."
            ),
            CalibrationError::Aborted => {
                "What happened: Calibration was aborted.\nHow to fix: Start a new calibration run.".to_string()
            }
            CalibrationError::AlreadyRunning => {
                "What happened: A calibration run is already in progress.\nHow to fix: Wait for it to finish or abort it first.".to_string()
            }
            CalibrationError::NotAwaitingVolume => {
                "What happened: No finished calibration move is waiting for a measured volume.\nHow to fix: Run `pump calibrate` and enter the volume when prompted.".to_string()
            }
        };
    }

    if let Some(se) = err.downcast_ref::<ScheduleError>() {
        return format!(
            "What happened: {se}.\nLikely causes: Out-of-range schedule setting.\nHow to fix: Use a finite, non-negative volume and a day/night split that sums to at most 1.0."
        );
    }

    if let Some(pe) = err.downcast_ref::<PumpError>() {
        return match pe {
            PumpError::Hardware(msg) | PumpError::HardwareFault(msg) => format!(
                "What happened: Stepper driver error ({msg}).\nLikely causes: Wrong STEP/DIR/EN pins, missing GPIO permissions, or driver fault.\nHow to fix: Check [pins] in the config and the wiring; the pump was left stopped."
            ),
            PumpError::Storage(msg) => format!(
                "What happened: Could not persist pump state ({msg}).\nLikely causes: storage.path is not writable.\nHow to fix: Point storage.path at a writable location."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return format!(
            "What happened: Could not read the config file.\nLikely causes: Wrong --config path.\nHow to fix: Pass --config <FILE> pointing at a pump TOML. Original: {msg}"
        );
    }

    if lower.contains("parse config") || lower.contains("missing field") {
        return format!(
            "What happened: Configuration is invalid or incomplete.\nLikely causes: Missing [pins] (step, dir) or a malformed value.\nHow to fix: Edit the TOML config and try again. Original: {msg}"
        );
    }

    if lower.starts_with("motor.")
        || lower.starts_with("calibration.")
        || lower.starts_with("schedule.")
        || lower.starts_with("storage.")
        || lower.starts_with("control_loop.")
        || lower.starts_with("logging.")
    {
        return format!(
            "What happened: Invalid configuration ({msg}).\nHow to fix: Edit the config file, then rerun."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: hardware 3, calibration 4, schedule input 5, storage 6,
/// everything else 1. Argument errors exit 2 via clap.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(pe) = err.downcast_ref::<PumpError>() {
        return match pe {
            PumpError::Hardware(_) | PumpError::HardwareFault(_) => 3,
            PumpError::Storage(_) => 6,
            _ => 1,
        };
    }
    if err.downcast_ref::<CalibrationError>().is_some() {
        return 4;
    }
    if err.downcast_ref::<ScheduleError>().is_some() {
        return 5;
    }
    1
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(pe) = err.downcast_ref::<PumpError>() {
        return match pe {
            PumpError::Hardware(_) => "Hardware",
            PumpError::HardwareFault(_) => "HardwareFault",
            PumpError::NotStarted => "NotStarted",
            PumpError::State(_) => "State",
            PumpError::Storage(_) => "Storage",
        };
    }
    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return match ce {
            CalibrationError::Stalled { .. } => "CalibrationStalled",
            CalibrationError::TimedOut { .. } => "CalibrationTimedOut",
            CalibrationError::Aborted => "CalibrationAborted",
            CalibrationError::AlreadyRunning => "CalibrationAlreadyRunning",
            CalibrationError::NotAwaitingVolume => "CalibrationNotAwaitingVolume",
        };
    }
    if err.downcast_ref::<ScheduleError>().is_some() {
        return "Schedule";
    }
    if err.downcast_ref::<BuildError>().is_some() {
        return "Config";
    }
    "Error"
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let details = match err.downcast_ref::<CalibrationError>() {
        Some(
            CalibrationError::Stalled { moved, target } | CalibrationError::TimedOut { moved, target },
        ) => Some(json!({ "moved": moved, "target": target })),
        _ => None,
    };
    let obj = match details {
        Some(d) => json!({ "reason": reason_name(err), "details": d, "message": humanize(err) }),
        None => json!({ "reason": reason_name(err), "message": humanize(err) }),
    };
    obj.to_string()
}
