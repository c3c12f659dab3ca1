//! Error taxonomy for the step engine.
//!
//! Every variant is fatal for the caller: there are no retries anywhere in
//! the crate, because a silently wrong position means physical travel outside
//! the safe range.

use std::path::PathBuf;
use thiserror::Error;

use crate::hardware::MotorPin;

#[derive(Debug, Error)]
pub enum MotorError {
    /// Invalid direction or mapping value supplied at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A persisted counter is absent. Never defaulted.
    #[error(
        "current motor location cannot be found: slot '{slot}' is missing in {location}. \
         Run `stepdrive reset` or recalibrate the system before retrying"
    )]
    MissingState { slot: String, location: String },

    /// Post-move invariant violated.
    #[error("position mismatch after move: expected {expected}, counter reads {actual}")]
    PositionMismatch { expected: i64, actual: i64 },

    #[error("failed to drive pin {pin:?}")]
    HardwareIo {
        pin: MotorPin,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to release the hardware port")]
    PortRelease {
        #[source]
        source: std::io::Error,
    },

    #[error("storage failure at {path:?}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("slot '{slot}' holds unreadable value {value:?}")]
    CorruptState { slot: String, value: String },

    #[error("motor has been shut down; hardware port is released")]
    Shutdown,
}

impl MotorError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        MotorError::Configuration(msg.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MotorError::Storage { path: path.into(), source }
    }
}

pub type MotorResult<T> = Result<T, MotorError>;
