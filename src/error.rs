//! Error types for the SCSI emulator core

use thiserror::Error;

/// SCSI emulator errors
///
/// These are fatal, host-visible failures. Guest-visible command failures
/// never travel this path; they are reported as CHECK CONDITION status
/// with sense data instead.
#[derive(Debug, Error)]
pub enum ScsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported device model: {0}")]
    UnsupportedModel(String),

    #[error("Migration stream error: {0}")]
    Migration(String),

    #[error("Request error: {0}")]
    Request(String),
}

/// Result type for SCSI emulator operations
pub type ScsiResult<T> = Result<T, ScsiError>;
