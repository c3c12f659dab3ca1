//! Full-range calibration.
//!
//! The controller steps the motor one step at a time in the configured
//! direction for as long as the signal source says CONTINUE. On STOP it
//! records how many steps it took, rewinds the same number of steps and
//! de-energises the motor.
//!
//! ```text
//! Polling --CONTINUE--> Stepping --> Polling ... --STOP--> Finalizing --> Done
//! ```
//!
//! There is no timeout: a source that never reports STOP keeps the loop alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

use crate::error::MotorResult;
use crate::hardware::HardwareOutputPort;
use crate::sequencer::Direction;
use crate::signal::{SignalSource, SignalStatus};
use crate::store::PersistentStore;
use crate::tracker::PositionTracker;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub direction: Direction,
    pub steps_traveled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Polling,
    Stepping,
    Finalizing,
    Done,
}

#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// `cw`/`ccw` or `0`/`1`, as written in the configuration.
    pub direction: String,
    /// Pause after a fresh signal update before reading it. Rate limit only.
    pub settle_delay: Duration,
}

impl CalibrationSettings {
    /// Parse `direction`. Callers that open hardware check this first.
    pub fn parse_direction(&self) -> MotorResult<Direction> {
        self.direction.parse::<Direction>()
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            direction: "cw".to_string(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

pub struct CalibrationController<P: HardwareOutputPort, S: PersistentStore, G: SignalSource> {
    tracker: PositionTracker<P, S>,
    signal: G,
    direction: Direction,
    settle_delay: Duration,
    state: CalibrationState,
    steps_traveled: u64,
    last_seen: Option<DateTime<Utc>>,
}

impl<P: HardwareOutputPort, S: PersistentStore, G: SignalSource> CalibrationController<P, S, G> {
    /// Fails with a configuration error on an unknown direction, before any
    /// step is taken.
    pub fn new(tracker: PositionTracker<P, S>, mut signal: G, settings: &CalibrationSettings) -> MotorResult<Self> {
        let direction = settings.parse_direction()?;
        let last_seen = signal.last_updated()?;
        Ok(Self {
            tracker,
            signal,
            direction,
            settle_delay: settings.settle_delay,
            state: CalibrationState::Polling,
            steps_traveled: 0,
            last_seen,
        })
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn steps_traveled(&self) -> u64 {
        self.steps_traveled
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn tracker(&self) -> &PositionTracker<P, S> {
        &self.tracker
    }

    pub fn into_tracker(self) -> PositionTracker<P, S> {
        self.tracker
    }

    fn poll(&mut self) -> MotorResult<SignalStatus> {
        let stamp = self.signal.last_updated()?;
        if stamp != self.last_seen {
            self.last_seen = stamp;
            if !self.settle_delay.is_zero() {
                log::debug!(target: "calibration", "Signal updated at {:?}, settling {:?}", stamp, self.settle_delay);
                thread::sleep(self.settle_delay);
            }
        }
        self.signal.read_status()
    }

    /// Perform one transition and return the state reached.
    pub fn advance(&mut self) -> MotorResult<CalibrationState> {
        self.state = match self.state {
            CalibrationState::Polling => match self.poll()? {
                SignalStatus::Continue => CalibrationState::Stepping,
                SignalStatus::Stop => CalibrationState::Finalizing,
            },
            CalibrationState::Stepping => {
                self.tracker.turn(self.direction, 1)?;
                self.steps_traveled += 1;
                CalibrationState::Polling
            }
            CalibrationState::Finalizing => {
                let result = CalibrationResult {
                    direction: self.direction,
                    steps_traveled: self.steps_traveled,
                };
                self.tracker.record_calibration(&result)?;
                log::info!(target: "calibration", "Number of steps moved is {}", self.steps_traveled);
                self.tracker.turn(self.direction.opposite(), self.steps_traveled)?;
                self.tracker.shutdown()?;
                CalibrationState::Done
            }
            CalibrationState::Done => CalibrationState::Done,
        };
        Ok(self.state)
    }

    /// Drive the state machine to completion.
    pub fn run(&mut self) -> MotorResult<CalibrationResult> {
        log::info!(target: "calibration", "Calibrating {:?} from position {}", self.direction, self.tracker.position());
        while self.advance()? != CalibrationState::Done {}
        Ok(CalibrationResult {
            direction: self.direction,
            steps_traveled: self.steps_traveled,
        })
    }
}
