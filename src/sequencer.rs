//! Phase sequencing for one motor.
//!
//! `step` walks the phase index one row around the phase table, writes the row
//! to the coil pins and then blocks for the step delay. The delay is a
//! correctness requirement of the mechanics: stepping faster than the rotor
//! can follow loses steps without any signal.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use crate::error::{MotorError, MotorResult};
use crate::hardware::{HardwareOutputPort, MotorPin};
use crate::phase_table::PhaseIndex;

pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(5);

/// Electrical turning direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Cw,
    Ccw,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Cw => Direction::Ccw,
            Direction::Ccw => Direction::Cw,
        }
    }

    /// Numeric code used in configuration and persistence: 0 = CW, 1 = CCW.
    pub fn code(self) -> i64 {
        match self {
            Direction::Cw => 0,
            Direction::Ccw => 1,
        }
    }
}

impl TryFrom<i64> for Direction {
    type Error = MotorError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Direction::Cw),
            1 => Ok(Direction::Ccw),
            other => Err(MotorError::configuration(format!(
                "unknown turning direction {}, expected 0 (CW) or 1 (CCW)",
                other
            ))),
        }
    }
}

impl FromStr for Direction {
    type Err = MotorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cw" | "0" => Ok(Direction::Cw),
            "ccw" | "1" => Ok(Direction::Ccw),
            other => Err(MotorError::configuration(format!(
                "unknown turning direction '{}', expected cw or ccw",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub struct StepSequencer<P> {
    port: P,
    phase: PhaseIndex,
    step_delay: Duration,
}

impl<P: HardwareOutputPort> StepSequencer<P> {
    pub fn new(port: P, phase: PhaseIndex, step_delay: Duration) -> Self {
        Self { port, phase, step_delay }
    }

    pub fn phase(&self) -> PhaseIndex {
        self.phase
    }

    /// Overwrite the index without touching the pins.
    pub fn set_phase(&mut self, phase: PhaseIndex) {
        self.phase = phase;
    }

    pub fn step_delay(&self) -> Duration {
        self.step_delay
    }

    /// CW walks the table backwards, CCW forwards.
    ///
    /// The index only advances once all four coils hold the new row; on a
    /// failed write it still names the last row fully written.
    pub fn step(&mut self, direction: Direction) -> MotorResult<()> {
        let next = match direction {
            Direction::Cw => self.phase.prev(),
            Direction::Ccw => self.phase.next(),
        };
        let pattern = next.pattern();
        for (pin, level) in MotorPin::COILS.iter().zip(pattern.iter()) {
            self.drive(*pin, *level)?;
        }
        self.phase = next;
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        Ok(())
    }

    pub(crate) fn drive(&mut self, pin: MotorPin, high: bool) -> MotorResult<()> {
        self.port
            .set_pin(pin, high)
            .map_err(|source| MotorError::HardwareIo { pin, source })
    }

    pub(crate) fn release(&mut self) -> MotorResult<()> {
        self.port.release().map_err(|source| MotorError::PortRelease { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedPort;

    fn sequencer(start: i64) -> (StepSequencer<SimulatedPort>, SimulatedPort) {
        let port = SimulatedPort::new();
        (StepSequencer::new(port.clone(), PhaseIndex::from_raw(start), Duration::ZERO), port)
    }

    #[test]
    fn cw_decrements_and_ccw_increments() {
        let (mut seq, _) = sequencer(0);
        seq.step(Direction::Cw).unwrap();
        assert_eq!(seq.phase().value(), 7);
        seq.step(Direction::Ccw).unwrap();
        seq.step(Direction::Ccw).unwrap();
        assert_eq!(seq.phase().value(), 1);
    }

    #[test]
    fn phase_stays_in_range_and_moves_by_one() {
        let (mut seq, _) = sequencer(3);
        let pattern = [
            Direction::Cw, Direction::Cw, Direction::Ccw, Direction::Cw, Direction::Cw,
            Direction::Cw, Direction::Cw, Direction::Cw, Direction::Ccw, Direction::Ccw,
        ];
        for dir in pattern.iter().cycle().take(50) {
            let before = seq.phase().value() as i64;
            seq.step(*dir).unwrap();
            let after = seq.phase().value() as i64;
            assert!(after < 8);
            let expected = match dir {
                Direction::Cw => (before - 1).rem_euclid(8),
                Direction::Ccw => (before + 1).rem_euclid(8),
            };
            assert_eq!(after, expected);
        }
    }

    #[test]
    fn step_writes_the_table_row_to_coils() {
        let (mut seq, port) = sequencer(0);
        seq.step(Direction::Ccw).unwrap();
        assert_eq!(port.write_count(), 4);
        assert_eq!(port.coil_levels(), [true, true, false, false]);
        seq.step(Direction::Cw).unwrap();
        seq.step(Direction::Cw).unwrap();
        assert_eq!(port.coil_levels(), [true, false, false, true]);
        assert!(!port.level(MotorPin::EnableA));
    }

    #[test]
    fn step_honours_delay() {
        let port = SimulatedPort::new();
        let mut seq = StepSequencer::new(port, PhaseIndex::default(), Duration::from_millis(5));
        let start = std::time::Instant::now();
        seq.step(Direction::Cw).unwrap();
        seq.step(Direction::Cw).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn hardware_fault_propagates() {
        let (mut seq, port) = sequencer(0);
        port.fail_on_write(2);
        match seq.step(Direction::Cw) {
            Err(MotorError::HardwareIo { pin, .. }) => assert_eq!(pin, MotorPin::In2),
            other => panic!("expected HardwareIo, got {:?}", other),
        }
        // half-written row: the index stays on the row that was fully driven
        assert_eq!(seq.phase().value(), 0);
        port.fail_on_write(1);
        assert!(seq.step(Direction::Ccw).is_err());
        assert_eq!(seq.phase().value(), 0);
        seq.step(Direction::Ccw).unwrap();
        assert_eq!(seq.phase().value(), 1);
        assert_eq!(port.coil_levels(), crate::phase_table::PHASE_TABLE[1]);
    }

    #[test]
    fn direction_parsing() {
        assert_eq!("CW".parse::<Direction>().unwrap(), Direction::Cw);
        assert_eq!(Direction::try_from(1).unwrap(), Direction::Ccw);
        assert!(matches!(Direction::try_from(2), Err(MotorError::Configuration(_))));
        assert!(matches!("up".parse::<Direction>(), Err(MotorError::Configuration(_))));
        assert_eq!(Direction::Cw.opposite(), Direction::Ccw);
    }
}
