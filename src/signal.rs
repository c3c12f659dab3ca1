//! Calibration stop signal.
//!
//! A source reports the most recently committed status together with the
//! time it was committed. Writers of [`FileSignal`] must go through
//! [`FileSignal::publish`], which replaces the file by rename, so a reader
//! never observes a half-written value. [`ChannelSignal`] is the in-process
//! equivalent built on a channel.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, SendError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MotorError, MotorResult};
use crate::store::replace_durably;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Stop,
    Continue,
}

impl SignalStatus {
    /// `1` continues; anything else stops.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            1 => SignalStatus::Continue,
            0 => SignalStatus::Stop,
            other => {
                log::warn!(target: "calibration", "Unexpected calibration status {}, treating as stop", other);
                SignalStatus::Stop
            }
        }
    }

    pub fn code(self) -> i64 {
        match self {
            SignalStatus::Stop => 0,
            SignalStatus::Continue => 1,
        }
    }
}

pub trait SignalSource {
    /// Commit time of the current status, `None` if nothing was committed yet.
    fn last_updated(&mut self) -> MotorResult<Option<DateTime<Utc>>>;

    fn read_status(&mut self) -> MotorResult<SignalStatus>;
}

/// Status kept in a file, commit time = file mtime.
#[derive(Debug, Clone)]
pub struct FileSignal {
    path: PathBuf,
}

impl FileSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically and durably replace the status file.
    pub fn publish(path: &Path, status: SignalStatus) -> MotorResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| MotorError::storage(parent, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));
        replace_durably(path, &tmp, format!("{}\n", status.code()).as_bytes())
    }
}

impl SignalSource for FileSignal {
    fn last_updated(&mut self) -> MotorResult<Option<DateTime<Utc>>> {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| MotorError::storage(&self.path, e))?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MotorError::storage(&self.path, e)),
        }
    }

    fn read_status(&mut self) -> MotorResult<SignalStatus> {
        let text = fs::read_to_string(&self.path).map_err(|e| MotorError::storage(&self.path, e))?;
        let raw = serde_yaml::from_str::<i64>(&text).map_err(|_| MotorError::CorruptState {
            slot: self.path.display().to_string(),
            value: text.trim().to_string(),
        })?;
        Ok(SignalStatus::from_raw(raw))
    }
}

/// Producer half of [`ChannelSignal`].
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<SignalStatus>,
}

impl SignalSender {
    pub fn send(&self, status: SignalStatus) -> Result<(), SendError<SignalStatus>> {
        self.tx.send(status)
    }
}

/// Latest status received over a channel.
///
/// Once every sender is gone the status latches to `Stop`: a vanished
/// producer can never ask the motor to stop anymore.
#[derive(Debug)]
pub struct ChannelSignal {
    rx: Receiver<SignalStatus>,
    latest: SignalStatus,
    updated: Option<DateTime<Utc>>,
    disconnected: bool,
}

impl ChannelSignal {
    pub fn channel(initial: SignalStatus) -> (SignalSender, ChannelSignal) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let signal = ChannelSignal {
            rx,
            latest: initial,
            updated: None,
            disconnected: false,
        };
        (SignalSender { tx }, signal)
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(status) => {
                    self.latest = status;
                    self.updated = Some(Utc::now());
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.disconnected {
                        self.disconnected = true;
                        if self.latest != SignalStatus::Stop {
                            log::warn!(target: "calibration", "Signal producer disconnected, stopping");
                            self.latest = SignalStatus::Stop;
                            self.updated = Some(Utc::now());
                        }
                    }
                    break;
                }
            }
        }
    }
}

impl SignalSource for ChannelSignal {
    fn last_updated(&mut self) -> MotorResult<Option<DateTime<Utc>>> {
        self.drain();
        Ok(self.updated)
    }

    fn read_status(&mut self) -> MotorResult<SignalStatus> {
        self.drain();
        Ok(self.latest)
    }
}
