use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("unsupported microstep setting {0}; expected a power of two in [1, 256]")]
    InvalidMicrosteps(u16),
    #[error("driver fault: {0}")]
    Fault(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
