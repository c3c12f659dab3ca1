//! Configuration for stepdrive hosts and motors.
//!
//! Single source of truth: stepdrive.yaml. The file has one section per OS
//! (`RaspberryPi`, `Ubuntu`, `macOS`), each mapping hostnames to a host block:
//!
//! ```yaml
//! RaspberryPi:
//!   intellux-1:
//!     STATE_DIR: stepper_position
//!     MOTORS:
//!       blinds:
//!         PINS: { IN1: 27, IN2: 17, IN3: 22, IN4: 18, ENABLE_A: 24, ENABLE_B: 23 }
//!         DIRECTION_MAPPING: direct
//!         CALIBRATION: { DIRECTION: cw, SIGNAL_FILE: calibration_info/calibration_status }
//! ```
//!
//! Missing required keys fail loudly; relative paths resolve against the
//! directory holding the YAML file.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calibration::{CalibrationSettings, DEFAULT_SETTLE_DELAY};
use crate::error::MotorError;
use crate::hardware::PinMap;
use crate::sequencer::{Direction, DEFAULT_STEP_DELAY};
use crate::tracker::DirectionMapping;

pub const CONFIG_FILE_NAME: &str = "stepdrive.yaml";
pub const CONFIG_ENV_VAR: &str = "STEPDRIVE_CONFIG";
pub const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";
pub const DEFAULT_FULL_REVOLUTION_STEPS: u32 = 400;
const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RawMotor {
    pins: PinMap,
    gpio_chip: Option<String>,
    step_delay_ms: Option<u64>,
    direction_mapping: Option<serde_yaml::Value>,
    full_revolution_steps: Option<u32>,
    calibration: Option<RawCalibration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct RawCalibration {
    direction: Option<serde_yaml::Value>,
    signal_file: Option<PathBuf>,
    settle_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MotorSettings {
    pub name: String,
    pub pins: PinMap,
    pub gpio_chip: String,
    pub step_delay: Duration,
    pub mapping: DirectionMapping,
    pub full_revolution_steps: u32,
    /// Directory holding this motor's slot files.
    pub state_dir: PathBuf,
    pub calibration: CalibrationSettings,
    pub signal_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub hostname: String,
    pub motors: BTreeMap<String, MotorSettings>,
}

impl HostSettings {
    /// Named motor, or the first one when no name is given.
    pub fn motor(&self, name: Option<&str>) -> Result<&MotorSettings> {
        match name {
            Some(name) => self.motors.get(name).ok_or_else(|| {
                anyhow!(
                    "No motor '{}' for host '{}' (configured: {:?})",
                    name,
                    self.hostname,
                    self.motors.keys().collect::<Vec<_>>()
                )
            }),
            None => self
                .motors
                .values()
                .next()
                .ok_or_else(|| anyhow!("MOTORS is empty for host '{}'", self.hostname)),
        }
    }
}

/// Explicit path, else `STEPDRIVE_CONFIG` (from the environment or `.env`),
/// else stepdrive.yaml next to Cargo.toml.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let _ = dotenv();
    match env::var(CONFIG_ENV_VAR) {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE_NAME),
    }
}

/// Load the host block for `hostname` from the YAML file at `path`.
pub fn load_host_settings(path: &Path, hostname: &str) -> Result<HostSettings> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("Missing required {} at {:?}: {}", CONFIG_FILE_NAME, path, e))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let settings = parse_host_settings(&text, hostname, base_dir)?;
    log::info!(target: "config_loader", "Loaded {} motor(s) for host '{}' from {:?}",
               settings.motors.len(), hostname, path);
    Ok(settings)
}

pub fn parse_host_settings(text: &str, hostname: &str, base_dir: &Path) -> Result<HostSettings> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).context("stepdrive.yaml is not valid YAML")?;

    // Search across known OS sections to find a host block matching hostname
    let mut host_block: Option<&serde_yaml::Mapping> = None;
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    host_block = v.as_mapping();
                    break;
                }
            }
        }
        if host_block.is_some() { break; }
    }
    let host_block = host_block.ok_or_else(|| anyhow!("No host entry for '{}' in {}", hostname, CONFIG_FILE_NAME))?;

    let state_dir = host_block
        .get(&serde_yaml::Value::from("STATE_DIR"))
        .and_then(|v| v.as_str())
        .map(|s| resolve(base_dir, Path::new(s)))
        .ok_or_else(|| anyhow!("STATE_DIR missing for '{}' in {}", hostname, CONFIG_FILE_NAME))?;

    let motors_map = host_block
        .get(&serde_yaml::Value::from("MOTORS"))
        .and_then(|v| v.as_mapping())
        .ok_or_else(|| anyhow!("MOTORS missing for '{}' in {}", hostname, CONFIG_FILE_NAME))?;

    let mut motors = BTreeMap::new();
    for (k, v) in motors_map.iter() {
        let name = k
            .as_str()
            .ok_or_else(|| anyhow!("Motor names under MOTORS must be strings (host '{}')", hostname))?
            .to_string();
        let raw: RawMotor = serde_yaml::from_value(v.clone())
            .with_context(|| format!("Invalid motor block '{}' for host '{}'", name, hostname))?;
        let motor = build_motor(&name, raw, &state_dir, base_dir)
            .with_context(|| format!("Invalid motor block '{}' for host '{}'", name, hostname))?;
        motors.insert(name, motor);
    }

    Ok(HostSettings {
        hostname: hostname.to_string(),
        motors,
    })
}

fn build_motor(name: &str, raw: RawMotor, state_dir: &Path, base_dir: &Path) -> Result<MotorSettings> {
    raw.pins.validate().map_err(MotorError::Configuration)?;

    let mapping = match raw.direction_mapping {
        Some(v) => scalar(&v, "DIRECTION_MAPPING")?.parse::<DirectionMapping>()?,
        None => DirectionMapping::Direct,
    };

    let (direction, signal_file, settle_delay) = match raw.calibration {
        Some(cal) => {
            let direction = match cal.direction {
                Some(v) => scalar(&v, "CALIBRATION.DIRECTION")?,
                None => "cw".to_string(),
            };
            // Reject a bad value now, before any motor is constructed
            direction.parse::<Direction>()?;
            let settle = cal.settle_delay_ms.map(Duration::from_millis).unwrap_or(DEFAULT_SETTLE_DELAY);
            (direction, cal.signal_file.map(|p| resolve(base_dir, &p)), settle)
        }
        None => ("cw".to_string(), None, DEFAULT_SETTLE_DELAY),
    };

    Ok(MotorSettings {
        name: name.to_string(),
        pins: raw.pins,
        gpio_chip: raw.gpio_chip.unwrap_or_else(|| DEFAULT_GPIO_CHIP.to_string()),
        step_delay: raw.step_delay_ms.map(Duration::from_millis).unwrap_or(DEFAULT_STEP_DELAY),
        mapping,
        full_revolution_steps: raw.full_revolution_steps.unwrap_or(DEFAULT_FULL_REVOLUTION_STEPS),
        state_dir: state_dir.join(name),
        calibration: CalibrationSettings { direction, settle_delay },
        signal_file,
    })
}

// Accept both `1` and `"inverted"` style values.
fn scalar(v: &serde_yaml::Value, key: &str) -> Result<String, MotorError> {
    match v {
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => Err(MotorError::configuration(format!("{} must be a number or string, got {:?}", key, other))),
    }
}

fn resolve(base_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
RaspberryPi:
  intellux-1:
    STATE_DIR: stepper_position
    MOTORS:
      blinds:
        PINS: { IN1: 27, IN2: 17, IN3: 22, IN4: 18, ENABLE_A: 24, ENABLE_B: 23 }
        DIRECTION_MAPPING: 1
        STEP_DELAY_MS: 8
        CALIBRATION:
          DIRECTION: ccw
          SIGNAL_FILE: calibration_info/calibration_status
          SETTLE_DELAY_MS: 0
Ubuntu:
  bench:
    STATE_DIR: /var/lib/stepdrive
    MOTORS:
      test:
        PINS: { IN1: 13, IN2: 11, IN3: 15, IN4: 12, ENABLE_A: 18, ENABLE_B: 16 }
"#;

    #[test]
    fn parses_host_block_with_overrides() {
        let host = parse_host_settings(SAMPLE, "intellux-1", Path::new("/opt/stepdrive")).unwrap();
        let m = host.motor(None).unwrap();
        assert_eq!(m.name, "blinds");
        assert_eq!(m.pins.in1, 27);
        assert_eq!(m.mapping, DirectionMapping::Inverted);
        assert_eq!(m.step_delay, Duration::from_millis(8));
        assert_eq!(m.calibration.direction, "ccw");
        assert_eq!(m.calibration.settle_delay, Duration::ZERO);
        assert_eq!(m.state_dir, PathBuf::from("/opt/stepdrive/stepper_position/blinds"));
        assert_eq!(
            m.signal_file.as_deref(),
            Some(Path::new("/opt/stepdrive/calibration_info/calibration_status"))
        );
    }

    #[test]
    fn applies_defaults() {
        let host = parse_host_settings(SAMPLE, "bench", Path::new("/tmp")).unwrap();
        let m = host.motor(Some("test")).unwrap();
        assert_eq!(m.mapping, DirectionMapping::Direct);
        assert_eq!(m.step_delay, DEFAULT_STEP_DELAY);
        assert_eq!(m.gpio_chip, DEFAULT_GPIO_CHIP);
        assert_eq!(m.full_revolution_steps, 400);
        assert_eq!(m.calibration.settle_delay, DEFAULT_SETTLE_DELAY);
        assert_eq!(m.state_dir, PathBuf::from("/var/lib/stepdrive/test"));
        assert!(m.signal_file.is_none());
        assert!(host.motor(Some("other")).is_err());
    }

    #[test]
    fn unknown_host_fails_loudly() {
        let err = parse_host_settings(SAMPLE, "nowhere", Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    // Only test that touches STEPDRIVE_CONFIG, so the set/remove cannot race.
    #[test]
    fn config_path_resolution_order() {
        let explicit = Path::new("/etc/stepdrive/custom.yaml");
        env::set_var(CONFIG_ENV_VAR, "/srv/stepdrive/from_env.yaml");
        assert_eq!(config_path(Some(explicit)), explicit.to_path_buf());
        assert_eq!(config_path(None), PathBuf::from("/srv/stepdrive/from_env.yaml"));

        env::set_var(CONFIG_ENV_VAR, "");
        assert_eq!(
            config_path(None),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE_NAME)
        );
        env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    fn bad_mapping_is_a_configuration_error() {
        let text = SAMPLE.replace("DIRECTION_MAPPING: 1", "DIRECTION_MAPPING: sideways");
        let err = parse_host_settings(&text, "intellux-1", Path::new("/tmp")).unwrap_err();
        assert!(err.chain().any(|e| matches!(e.downcast_ref::<MotorError>(), Some(MotorError::Configuration(_)))));
    }

    #[test]
    fn bad_calibration_direction_is_rejected() {
        let text = SAMPLE.replace("DIRECTION: ccw", "DIRECTION: 3");
        assert!(parse_host_settings(&text, "intellux-1", Path::new("/tmp")).is_err());
    }

    #[test]
    fn duplicate_pins_are_rejected() {
        let text = SAMPLE.replace("ENABLE_B: 23", "ENABLE_B: 27");
        assert!(parse_host_settings(&text, "intellux-1", Path::new("/tmp")).is_err());
    }
}
