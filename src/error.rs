use thiserror::Error;

/// Main error type for pipelog
#[derive(Debug, Error)]
pub enum PipelogError {
    // Setup errors (fatal before the capture loop starts)
    #[error("Setup failed: {0}")]
    SetupError(String),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Capture loop errors (local to one log target)
    #[error("Failed to open log file: {0}")]
    LogFileError(String),

    #[error("Failed to write log file: {0}")]
    LogWriteError(String),

    #[error("Pipe error: {0}")]
    PipeError(String),

    // Child reaping errors
    #[error("Failed to wait for child: {0}")]
    WaitError(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

impl PipelogError {
    /// Process exit status reported when this error ends the program
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result type alias for pipelog operations
pub type Result<T> = std::result::Result<T, PipelogError>;
