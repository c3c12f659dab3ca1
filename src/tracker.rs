//! Absolute position tracking on top of the step sequencer.
//!
//! The tracker exclusively owns the motor state (phase index, global
//! position, mapping), the hardware port (through the sequencer) and the
//! persistent store. Nothing else mutates any of them.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::calibration::CalibrationResult;
use crate::error::{MotorError, MotorResult};
use crate::hardware::{HardwareOutputPort, MotorPin};
use crate::phase_table::PhaseIndex;
use crate::sequencer::{Direction, StepSequencer};
use crate::store::{MotorStateStore, PersistentStore};

/// Correspondence between turning direction and the sign of position change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DirectionMapping {
    /// CW increments the global position.
    #[default]
    Direct,
    /// CCW increments the global position.
    Inverted,
}

impl DirectionMapping {
    /// Position change caused by one step in `direction`.
    pub fn delta(self, direction: Direction) -> i64 {
        match (self, direction) {
            (DirectionMapping::Direct, Direction::Cw) | (DirectionMapping::Inverted, Direction::Ccw) => 1,
            _ => -1,
        }
    }

    /// The direction that increases the global position.
    pub fn increasing(self) -> Direction {
        match self {
            DirectionMapping::Direct => Direction::Cw,
            DirectionMapping::Inverted => Direction::Ccw,
        }
    }
}

impl TryFrom<i64> for DirectionMapping {
    type Error = MotorError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DirectionMapping::Direct),
            1 => Ok(DirectionMapping::Inverted),
            other => Err(MotorError::configuration(format!(
                "unknown direction mapping {}, expected 0 (direct) or 1 (inverted)",
                other
            ))),
        }
    }
}

impl FromStr for DirectionMapping {
    type Err = MotorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "0" => Ok(DirectionMapping::Direct),
            "inverted" | "1" => Ok(DirectionMapping::Inverted),
            other => Err(MotorError::configuration(format!(
                "unknown direction mapping '{}', expected direct or inverted",
                other
            ))),
        }
    }
}

/// The unit of persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorState {
    #[serde(serialize_with = "serialize_phase")]
    pub phase: PhaseIndex,
    pub position: i64,
    pub mapping: DirectionMapping,
}

fn serialize_phase<S: serde::Serializer>(phase: &PhaseIndex, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u8(phase.value())
}

#[derive(Debug)]
pub struct PositionTracker<P: HardwareOutputPort, S: PersistentStore> {
    sequencer: StepSequencer<P>,
    position: i64,
    mapping: DirectionMapping,
    store: MotorStateStore<S>,
    shut_down: bool,
}

impl<P: HardwareOutputPort, S: PersistentStore> PositionTracker<P, S> {
    /// Load the persisted counters, then energise the driver.
    ///
    /// Fails with [`MotorError::MissingState`] before any pin is driven when
    /// either counter is absent.
    pub fn new(port: P, store: S, mapping: DirectionMapping, step_delay: Duration) -> MotorResult<Self> {
        let store = MotorStateStore::new(store);
        let state = store.load(mapping)?;

        let mut tracker = Self {
            sequencer: StepSequencer::new(port, state.phase, step_delay),
            position: state.position,
            mapping,
            store,
            shut_down: false,
        };
        tracker.energize()?;

        log::info!(target: "tracker", "Motor ready: phase={} position={} mapping={:?}",
                   state.phase.value(), state.position, mapping);
        Ok(tracker)
    }

    // Coils low, bridge enabled.
    fn energize(&mut self) -> MotorResult<()> {
        for pin in MotorPin::COILS {
            self.sequencer.drive(pin, false)?;
        }
        for pin in MotorPin::ENABLES {
            self.sequencer.drive(pin, true)?;
        }
        Ok(())
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn phase(&self) -> PhaseIndex {
        self.sequencer.phase()
    }

    pub fn mapping(&self) -> DirectionMapping {
        self.mapping
    }

    pub fn state(&self) -> MotorState {
        MotorState {
            phase: self.sequencer.phase(),
            position: self.position,
            mapping: self.mapping,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Step `count` times; the counter follows every individual step.
    /// Does not persist.
    pub fn turn(&mut self, direction: Direction, count: u64) -> MotorResult<()> {
        if self.shut_down {
            return Err(MotorError::Shutdown);
        }
        let delta = self.mapping.delta(direction);
        for _ in 0..count {
            self.sequencer.step(direction)?;
            self.position += delta;
            log::debug!(target: "tracker", "{:?} step -> phase={} position={}",
                        direction, self.sequencer.phase().value(), self.position);
        }
        Ok(())
    }

    /// Move to an absolute position and persist the result.
    pub fn move_to(&mut self, target: i64) -> MotorResult<()> {
        let start = self.position;
        if target != start {
            let direction = if target > start {
                self.mapping.increasing()
            } else {
                self.mapping.increasing().opposite()
            };
            let count = target.abs_diff(start);
            log::info!(target: "tracker", "Moving {} -> {} ({} {:?} steps)", start, target, count, direction);
            self.turn(direction, count)?;
            self.ensure_at(target)?;
        }
        self.persist()
    }

    fn ensure_at(&self, target: i64) -> MotorResult<()> {
        if self.position != target {
            return Err(MotorError::PositionMismatch {
                expected: target,
                actual: self.position,
            });
        }
        Ok(())
    }

    /// Zero both counters and persist. The motor does not move.
    pub fn reset_position(&mut self) -> MotorResult<()> {
        self.sequencer.set_phase(PhaseIndex::default());
        self.position = 0;
        self.persist()?;
        log::info!(target: "tracker", "Position reset to 0");
        Ok(())
    }

    pub fn persist(&mut self) -> MotorResult<()> {
        let state = self.state();
        self.store.save(&state)
    }

    pub fn record_calibration(&mut self, result: &CalibrationResult) -> MotorResult<()> {
        self.store.save_calibration(result)
    }

    pub fn calibration(&self) -> MotorResult<Option<CalibrationResult>> {
        self.store.load_calibration()
    }

    /// De-energise all six lines and release the port. Safe to call again.
    ///
    /// Every line is attempted even if one fails; the first failure is
    /// returned.
    pub fn shutdown(&mut self) -> MotorResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let mut first_err = None;
        for pin in MotorPin::ALL {
            if let Err(e) = self.sequencer.drive(pin, false) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.sequencer.release() {
            first_err.get_or_insert(e);
        }
        log::info!(target: "tracker", "Motor de-energised at position {}", self.position);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<P: HardwareOutputPort, S: PersistentStore> Drop for PositionTracker<P, S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!(target: "tracker", "Failed to de-energise motor on drop: {}", e);
        }
    }
}
