//! stepdrive library
//!
//! Position-tracking step engine for a bipolar stepper on a 4-input H-bridge,
//! with durable counters and a signal-driven full-range calibration.

pub mod calibration;
pub mod config_loader;
pub mod error;
pub mod hardware;
pub mod phase_table;
pub mod sequencer;
pub mod signal;
pub mod store;
pub mod tracker;

pub use calibration::{CalibrationController, CalibrationResult, CalibrationSettings, CalibrationState};
pub use error::{MotorError, MotorResult};
pub use hardware::{HardwareOutputPort, MotorPin, PinMap};
pub use sequencer::Direction;
pub use signal::{SignalSource, SignalStatus};
pub use store::{FileStore, MemoryStore, MotorStateStore, PersistentStore};
pub use tracker::{DirectionMapping, MotorState, PositionTracker};
