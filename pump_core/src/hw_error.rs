//! Maps `Box<dyn Error>` from trait boundaries to typed `PumpError`.
//!
//! The traits in `pump_traits` use `Box<dyn Error + Send + Sync>` for maximum
//! flexibility; this module converts those to our typed error enum, with an
//! optional feature-gated path for `pump_hardware::HwError` downcasting.

use crate::error::PumpError;

/// Map a trait-boundary error to a typed `PumpError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to wrapping the message.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> PumpError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<pump_hardware::error::HwError>() {
            return match hw {
                pump_hardware::error::HwError::Gpio(msg) => PumpError::HardwareFault(msg.clone()),
                other => PumpError::Hardware(other.to_string()),
            };
        }
    }

    PumpError::Hardware(e.to_string())
}

/// Map a store commit failure.
pub fn map_store_error(e: &(dyn std::error::Error + 'static)) -> PumpError {
    PumpError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_errors_become_hardware() {
        let e = std::io::Error::other("boom");
        match map_hw_error(&e) {
            PumpError::Hardware(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn gpio_errors_become_faults() {
        let e = pump_hardware::error::HwError::Gpio("pin 5 busy".into());
        assert!(matches!(map_hw_error(&e), PumpError::HardwareFault(_)));
    }
}
