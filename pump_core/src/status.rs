//! Status values reported by the control loop and the default status sink.

use pump_traits::StatusSink;

/// Result of one [`PumpController::tick`](crate::pump::PumpController::tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionStatus {
    /// Nothing to do.
    Idle,
    /// Position move in progress.
    Moving { remaining: i64 },
    /// Continuous (peristaltic) rotation.
    Running,
    /// A position move finished during this tick; driver already disabled.
    Completed { steps: i64 },
}

/// Forwards status lines to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn show(&mut self, line: &str) {
        tracing::info!(target: "pump::status", "{line}");
    }
}
