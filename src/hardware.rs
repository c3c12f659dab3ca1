/// Hardware output ports for the H-bridge driver.
///
/// Each motor owns exactly one port instance; there is no shared GPIO state.
/// The real port uses libgpiod character devices (feature `gpiod`), the
/// simulated port records writes for dry runs and tests.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex};

#[cfg(feature = "gpiod")]
use gpiocdev::line::Value;
#[cfg(feature = "gpiod")]
use gpiocdev::request::Request;

/// The six lines wired to one L298N-style driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorPin {
    In1,
    In2,
    In3,
    In4,
    EnableA,
    EnableB,
}

impl MotorPin {
    pub const COILS: [MotorPin; 4] = [MotorPin::In1, MotorPin::In2, MotorPin::In3, MotorPin::In4];
    pub const ENABLES: [MotorPin; 2] = [MotorPin::EnableA, MotorPin::EnableB];
    pub const ALL: [MotorPin; 6] = [
        MotorPin::In1,
        MotorPin::In2,
        MotorPin::In3,
        MotorPin::In4,
        MotorPin::EnableA,
        MotorPin::EnableB,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Capability to set a named pin high or low.
pub trait HardwareOutputPort {
    fn set_pin(&mut self, pin: MotorPin, high: bool) -> io::Result<()>;

    /// Give the lines back to the system. Called once, after the final writes.
    fn release(&mut self) -> io::Result<()>;
}

impl<T: HardwareOutputPort + ?Sized> HardwareOutputPort for Box<T> {
    fn set_pin(&mut self, pin: MotorPin, high: bool) -> io::Result<()> {
        (**self).set_pin(pin, high)
    }

    fn release(&mut self) -> io::Result<()> {
        (**self).release()
    }
}

/// Line offsets on the gpiochip, as written in the YAML `PINS` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PinMap {
    pub in1: u32,
    pub in2: u32,
    pub in3: u32,
    pub in4: u32,
    pub enable_a: u32,
    pub enable_b: u32,
}

impl PinMap {
    pub fn offset(&self, pin: MotorPin) -> u32 {
        match pin {
            MotorPin::In1 => self.in1,
            MotorPin::In2 => self.in2,
            MotorPin::In3 => self.in3,
            MotorPin::In4 => self.in4,
            MotorPin::EnableA => self.enable_a,
            MotorPin::EnableB => self.enable_b,
        }
    }

    pub fn offsets(&self) -> Vec<u32> {
        MotorPin::ALL.iter().map(|p| self.offset(*p)).collect()
    }

    /// All six offsets must be distinct or two pins would alias one line.
    pub fn validate(&self) -> Result<(), String> {
        let offsets = self.offsets();
        for (i, a) in offsets.iter().enumerate() {
            if offsets[i + 1..].contains(a) {
                return Err(format!("line offset {} is assigned to more than one motor pin", a));
            }
        }
        Ok(())
    }
}

/// libgpiod-backed output port.
#[derive(Debug)]
pub struct GpiodOutputPort {
    chip_path: String,
    pins: PinMap,
    #[cfg(feature = "gpiod")]
    request: Option<Request>,
}

impl GpiodOutputPort {
    /// Request all six lines as outputs, initially low.
    #[cfg(feature = "gpiod")]
    pub fn open(chip_path: &str, pins: PinMap) -> anyhow::Result<Self> {
        use anyhow::{anyhow, Context};

        pins.validate().map_err(|e| anyhow!(e))?;
        let request = Request::builder()
            .on_chip(chip_path)
            .with_consumer("stepdrive")
            .with_lines(&pins.offsets())
            .as_output(Value::Inactive)
            .request()
            .with_context(|| format!("Failed to request motor lines {:?} on {}", pins.offsets(), chip_path))?;

        log::info!(target: "hardware", "Requested lines {:?} on {}", pins.offsets(), chip_path);

        Ok(Self {
            chip_path: chip_path.to_string(),
            pins,
            request: Some(request),
        })
    }

    #[cfg(not(feature = "gpiod"))]
    pub fn open(_chip_path: &str, _pins: PinMap) -> anyhow::Result<Self> {
        Err(anyhow::anyhow!("GPIO support not compiled in. Enable 'gpiod' feature or use --dry-run."))
    }

    pub fn chip_path(&self) -> &str {
        &self.chip_path
    }
}

impl HardwareOutputPort for GpiodOutputPort {
    #[cfg(feature = "gpiod")]
    fn set_pin(&mut self, pin: MotorPin, high: bool) -> io::Result<()> {
        let request = self
            .request
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "lines already released"))?;
        let value = if high { Value::Active } else { Value::Inactive };
        request.set_value(self.pins.offset(pin), value).map_err(io::Error::other)?;
        Ok(())
    }

    #[cfg(not(feature = "gpiod"))]
    fn set_pin(&mut self, pin: MotorPin, _high: bool) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot drive line {}: GPIO support not compiled in", self.pins.offset(pin)),
        ))
    }

    fn release(&mut self) -> io::Result<()> {
        #[cfg(feature = "gpiod")]
        {
            // Lines are returned to the kernel when the request drops
            if self.request.take().is_some() {
                log::info!(target: "hardware", "GPIO lines on {} released.", self.chip_path);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimState {
    writes: Vec<(MotorPin, bool)>,
    levels: [bool; 6],
    released: bool,
    fail_on_write: Option<usize>,
    fail_on_release: bool,
}

/// In-memory port. Clones share the same record so a test can keep a handle
/// while the tracker owns the port.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPort {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th write from now (1-based) fail with an I/O error.
    pub fn fail_on_write(&self, n: usize) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_on_write = Some(s.writes.len() + n);
        }
    }

    /// Make the next `release` fail.
    pub fn fail_on_release(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_on_release = true;
        }
    }

    pub fn writes(&self) -> Vec<(MotorPin, bool)> {
        self.state.lock().map(|s| s.writes.clone()).unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes.len()).unwrap_or(0)
    }

    pub fn level(&self, pin: MotorPin) -> bool {
        self.state.lock().map(|s| s.levels[pin.slot()]).unwrap_or(false)
    }

    /// Current IN1..IN4 levels.
    pub fn coil_levels(&self) -> [bool; 4] {
        let mut out = [false; 4];
        for (i, pin) in MotorPin::COILS.iter().enumerate() {
            out[i] = self.level(*pin);
        }
        out
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().map(|s| s.released).unwrap_or(false)
    }
}

impl HardwareOutputPort for SimulatedPort {
    fn set_pin(&mut self, pin: MotorPin, high: bool) -> io::Result<()> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| io::Error::other("simulated port state poisoned"))?;
        if s.released {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "simulated port released"));
        }
        if s.fail_on_write == Some(s.writes.len() + 1) {
            s.fail_on_write = None;
            return Err(io::Error::other(format!("simulated fault driving {:?}", pin)));
        }
        s.writes.push((pin, high));
        s.levels[pin.slot()] = high;
        log::trace!(target: "hardware", "sim {:?} -> {}", pin, high);
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| io::Error::other("simulated port state poisoned"))?;
        if s.fail_on_release {
            s.fail_on_release = false;
            return Err(io::Error::other("simulated fault releasing lines"));
        }
        s.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins() -> PinMap {
        PinMap { in1: 27, in2: 17, in3: 22, in4: 18, enable_a: 24, enable_b: 23 }
    }

    #[test]
    fn pin_map_rejects_duplicate_offsets() {
        let mut map = pins();
        assert!(map.validate().is_ok());
        map.enable_b = 27;
        assert!(map.validate().is_err());
    }

    #[test]
    fn simulated_port_records_and_fails_on_demand() {
        let mut port = SimulatedPort::new();
        let handle = port.clone();
        port.set_pin(MotorPin::In1, true).unwrap();
        handle.fail_on_write(2);
        port.set_pin(MotorPin::In2, true).unwrap();
        assert!(port.set_pin(MotorPin::In3, true).is_err());
        assert_eq!(handle.writes(), vec![(MotorPin::In1, true), (MotorPin::In2, true)]);
        assert_eq!(handle.coil_levels(), [true, true, false, false]);
        // fault is one-shot
        port.set_pin(MotorPin::In3, true).unwrap();
    }

    #[test]
    fn simulated_port_refuses_writes_after_release() {
        let mut port = SimulatedPort::new();
        port.release().unwrap();
        assert!(port.is_released());
        assert!(port.set_pin(MotorPin::EnableA, false).is_err());
    }

    #[cfg(not(feature = "gpiod"))]
    #[test]
    fn gpiod_port_requires_feature() {
        assert!(GpiodOutputPort::open("/dev/gpiochip0", pins()).is_err());
    }
}
