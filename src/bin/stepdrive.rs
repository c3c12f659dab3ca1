//! Operator CLI for one stepper motor.
//!
//! Run with: cargo run --bin stepdrive --features gpiod -- <command>
//! Use `--dry-run` on machines without GPIO; pin writes are simulated but the
//! state files are real.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use gethostname::gethostname;
use serde::Serialize;
use std::path::PathBuf;

use stepdrive::config_loader::{self, MotorSettings};
use stepdrive::hardware::{GpiodOutputPort, SimulatedPort};
use stepdrive::signal::FileSignal;
use stepdrive::{
    CalibrationController, CalibrationResult, Direction, FileStore, HardwareOutputPort, MotorState,
    MotorStateStore, PositionTracker, SignalStatus,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to stepdrive.yaml (default: $STEPDRIVE_CONFIG or the package directory)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Host block to use instead of this machine's hostname
    #[arg(long)]
    host: Option<String>,
    /// Motor name under MOTORS (default: the first one)
    #[arg(long)]
    motor: Option<String>,
    /// Simulate pin writes instead of opening the gpiochip
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted counters and last calibration
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Move to an absolute position
    MoveTo {
        #[arg(allow_hyphen_values = true)]
        target: i64,
    },
    /// Step a relative amount and persist
    Turn {
        /// cw or ccw
        direction: String,
        count: u64,
        /// Interpret COUNT as full revolutions
        #[arg(long, default_value_t = false)]
        revolutions: bool,
    },
    /// Zero both counters without moving the motor
    Reset,
    /// Step until the calibration signal says stop, then rewind
    Calibrate {
        /// Override CALIBRATION.DIRECTION (cw or ccw)
        #[arg(long)]
        direction: Option<String>,
    },
    /// Publish a calibration status (1 = continue, 0 = stop)
    Signal { status: i64 },
}

#[derive(Serialize)]
struct StatusReport<'a> {
    host: &'a str,
    motor: &'a str,
    state_dir: String,
    state: Option<MotorState>,
    calibration: Option<CalibrationResult>,
}

fn open_port(motor: &MotorSettings, dry_run: bool) -> Result<Box<dyn HardwareOutputPort>> {
    if dry_run {
        log::info!(target: "hardware", "Dry run: pin writes for '{}' are simulated", motor.name);
        return Ok(Box::new(SimulatedPort::new()));
    }
    Ok(Box::new(GpiodOutputPort::open(&motor.gpio_chip, motor.pins)?))
}

fn open_tracker(
    motor: &MotorSettings,
    dry_run: bool,
) -> Result<PositionTracker<Box<dyn HardwareOutputPort>, FileStore>> {
    // Load state before claiming any lines so a missing state touches no pin
    MotorStateStore::new(FileStore::new(&motor.state_dir)).load(motor.mapping)?;
    let port = open_port(motor, dry_run)?;
    let tracker = PositionTracker::new(port, FileStore::new(&motor.state_dir), motor.mapping, motor.step_delay)?;
    Ok(tracker)
}

fn status(host: &str, motor: &MotorSettings, json: bool) -> Result<()> {
    let store = MotorStateStore::new(FileStore::new(&motor.state_dir));
    let state = match store.load(motor.mapping) {
        Ok(state) => Some(state),
        Err(stepdrive::MotorError::MissingState { .. }) => None,
        Err(e) => return Err(e.into()),
    };
    let report = StatusReport {
        host,
        motor: &motor.name,
        state_dir: motor.state_dir.display().to_string(),
        state,
        calibration: store.load_calibration()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Motor '{}' on {} ({})", report.motor, report.host, report.state_dir);
    match report.state {
        Some(s) => println!("  phase index: {}\n  position:    {}\n  mapping:     {:?}", s.phase.value(), s.position, s.mapping),
        None => println!("  position unknown: run `stepdrive reset` or calibrate"),
    }
    match report.calibration {
        Some(c) => println!("  full range:  {} steps ({:?})", c.steps_traveled, c.direction),
        None => println!("  full range:  not calibrated"),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let hostname = args
        .host
        .clone()
        .unwrap_or_else(|| gethostname().to_string_lossy().to_string());
    let config_path = config_loader::config_path(args.config.as_deref());
    let host = config_loader::load_host_settings(&config_path, &hostname)?;
    let motor = host.motor(args.motor.as_deref())?.clone();

    match args.command {
        Command::Status { json } => status(&hostname, &motor, json)?,
        Command::MoveTo { target } => {
            let mut tracker = open_tracker(&motor, args.dry_run)?;
            tracker.move_to(target)?;
            tracker.shutdown()?;
            println!("Motor '{}' at position {}", motor.name, tracker.position());
        }
        Command::Turn { direction, count, revolutions } => {
            let direction = direction.parse::<Direction>()?;
            let steps = if revolutions {
                count
                    .checked_mul(motor.full_revolution_steps as u64)
                    .ok_or_else(|| anyhow!("{} revolutions is out of range", count))?
            } else {
                count
            };
            let mut tracker = open_tracker(&motor, args.dry_run)?;
            tracker.turn(direction, steps)?;
            tracker.persist()?;
            tracker.shutdown()?;
            println!("Motor '{}' at position {}", motor.name, tracker.position());
        }
        Command::Reset => {
            MotorStateStore::new(FileStore::new(&motor.state_dir)).reset()?;
            println!("Motor '{}' counters reset to 0", motor.name);
        }
        Command::Calibrate { direction } => {
            let signal_path = motor
                .signal_file
                .clone()
                .ok_or_else(|| anyhow!("CALIBRATION.SIGNAL_FILE missing for motor '{}'", motor.name))?;
            let mut settings = motor.calibration.clone();
            if let Some(d) = direction {
                settings.direction = d;
            }
            // Reject a bad override before any line is claimed
            settings.parse_direction()?;
            let tracker = open_tracker(&motor, args.dry_run)?;
            let mut controller = CalibrationController::new(tracker, FileSignal::new(signal_path), &settings)?;
            let result = controller.run().context("Calibration aborted")?;
            println!("Full range: {} steps ({:?})", result.steps_traveled, result.direction);
        }
        Command::Signal { status } => {
            let status = match status {
                0 => SignalStatus::Stop,
                1 => SignalStatus::Continue,
                other => return Err(anyhow!("status must be 0 or 1, got {}", other)),
            };
            let path = motor
                .signal_file
                .as_deref()
                .ok_or_else(|| anyhow!("CALIBRATION.SIGNAL_FILE missing for motor '{}'", motor.name))?;
            FileSignal::publish(path, status)?;
            log::info!(target: "calibration", "Published {:?} to {:?}", status, path);
        }
    }
    Ok(())
}
