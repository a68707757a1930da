use thiserror::Error;

/// Odometer error types
#[derive(Error, Debug)]
pub enum OdometerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid odometer value: {0}")]
    InvalidOdometer(f64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Persistence worker is no longer running")]
    PersistenceClosed,
}

/// Result type for odometer operations
pub type Result<T> = std::result::Result<T, OdometerError>;
