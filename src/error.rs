use thiserror::Error;

/// Errors raised by the capture core.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Operation invalid in the current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),
    /// Buffer/stream binding conflict or missing binding.
    #[error("binding error: {0}")]
    Binding(String),
    /// Unvalidated or hardware-incompatible configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Buffer memory could not be provided.
    #[error("buffer allocation failed: {0}")]
    Allocation(String),
    /// Exclusive acquire conflict.
    #[error("camera {0} is busy")]
    Busy(String),
    #[error("camera {0} not found")]
    NotFound(String),
    #[error("failed to load settings: {0}")]
    Config(#[from] config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
