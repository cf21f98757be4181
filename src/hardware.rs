#![warn(clippy::pedantic)]
//! The two hardware capabilities the control loop needs, plus the adapters for the lab setup: a
//! USB photon counter as the lock signal, the pattern-generator DAC (driven through its
//! `usbdacset` command line tool) for the output voltages, and a simulated cavity for running
//! without either.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;
use serialport::SerialPort;

use crate::error::HardwareError;

/// Blocking source of raw lock-signal samples.
pub trait SignalSource: Send {
    /// # Errors
    /// Any failure to obtain a sample. The poller skips the sample and tries again.
    fn read_signal(&mut self) -> Result<f64, HardwareError>;

    /// Called once when the poller stops.
    /// # Errors
    /// Any failure to reset the device.
    fn reset(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// Destination of the ramped output voltages. Channels are numbered from 1.
pub trait VoltageSink: Send {
    /// # Errors
    /// Any failure to issue the voltage.
    fn write_voltage(&mut self, channel: usize, volts: f64) -> Result<(), HardwareError>;

    /// Called once at shutdown, after every output has ramped to zero.
    /// # Errors
    /// Any failure to reset the device.
    fn reset(&mut self) -> Result<(), HardwareError>;
}

impl<T: SignalSource + ?Sized> SignalSource for Box<T> {
    fn read_signal(&mut self) -> Result<f64, HardwareError> {
        (**self).read_signal()
    }

    fn reset(&mut self) -> Result<(), HardwareError> {
        (**self).reset()
    }
}

impl<T: VoltageSink + ?Sized> VoltageSink for Box<T> {
    fn write_voltage(&mut self, channel: usize, volts: f64) -> Result<(), HardwareError> {
        (**self).write_voltage(channel, volts)
    }

    fn reset(&mut self) -> Result<(), HardwareError> {
        (**self).reset()
    }
}

/// USB counter speaking a newline-terminated text protocol at 115200 baud. `COUNTS?` opens one
/// gate window and answers with space-separated counts for every input.
pub struct UsbCounter {
    port: Box<dyn SerialPort>,
    channel: usize,
}

impl UsbCounter {
    pub const BAUDRATE: u32 = 115_200;

    /// # Errors
    /// Propagates failures to open the port or to program the gate time.
    pub fn open(path: &str, channel: usize, gate_time_ms: u32) -> Result<Self, HardwareError> {
        let port = serialport::new(path, Self::BAUDRATE)
            .timeout(Duration::from_secs(1))
            .open()?;
        let mut counter = UsbCounter { port, channel };
        // the counter answers the first line after power-up with an "unknown command" notice
        counter.sendcmd("a")?;
        let _ = counter.read_line();
        counter.set_gate_time(gate_time_ms)?;
        info!(
            "opened counter {path} ({}), gate time {gate_time_ms} ms",
            counter.query("*IDN?").unwrap_or_default()
        );
        Ok(counter)
    }

    fn sendcmd(&mut self, cmd: &str) -> Result<(), HardwareError> {
        self.port.write_all(format!("{cmd}\n").as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, HardwareError> {
        let mut response = Vec::new();
        let mut single_buf = [0u8];
        let tic = Instant::now();
        while tic.elapsed() < self.port.timeout() {
            self.port.read_exact(&mut single_buf)?;
            if single_buf[0] == b'\n' {
                break;
            }
            response.push(single_buf[0]);
        }
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }

    fn query(&mut self, cmd: &str) -> Result<String, HardwareError> {
        self.sendcmd(cmd)?;
        self.read_line()
    }

    /// # Errors
    /// Propagates serial write failures.
    pub fn set_gate_time(&mut self, gate_time_ms: u32) -> Result<(), HardwareError> {
        self.sendcmd(&format!("TIME{}", gate_time_ms.clamp(1, 65535)))
    }

    /// # Errors
    /// Serial failures, or a reply without a count for the configured input.
    pub fn get_counts(&mut self) -> Result<f64, HardwareError> {
        let reply = self.query("COUNTS?")?;
        parse_counts(&reply, self.channel).ok_or_else(|| HardwareError::BadReply {
            query: "COUNTS?".to_string(),
            reply,
        })
    }
}

/// Count of input `channel` from a `COUNTS?` reply.
fn parse_counts(reply: &str, channel: usize) -> Option<f64> {
    reply.split_whitespace().nth(channel)?.parse::<f64>().ok()
}

impl SignalSource for UsbCounter {
    fn read_signal(&mut self) -> Result<f64, HardwareError> {
        self.get_counts()
    }

    fn reset(&mut self) -> Result<(), HardwareError> {
        self.sendcmd("*RST")
    }
}

/// Issues voltages through the pattern generator's `usbdacset` tool:
/// `usbdacset -d <device> <channel - 1> <volts>`.
#[derive(Debug, Clone)]
pub struct DacProgram {
    program: PathBuf,
    device: String,
}

impl DacProgram {
    #[must_use]
    pub fn new(program: &str, device: &str) -> Self {
        DacProgram {
            program: expand_home(program),
            device: device.to_string(),
        }
    }

    #[must_use]
    pub fn command(&self, channel: usize, volts: f64) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-d")
            .arg(&self.device)
            .arg(channel.saturating_sub(1).to_string())
            .arg(format!("{volts:.3}"));
        cmd
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

impl VoltageSink for DacProgram {
    fn write_voltage(&mut self, channel: usize, volts: f64) -> Result<(), HardwareError> {
        debug!("output voltage {channel} set to {volts:.3}");
        let status = self.command(channel, volts).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(HardwareError::DacProgram(status))
        }
    }

    fn reset(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

/// A cavity whose transmission is a Gaussian peak in the voltages on channels 5 and 6, with
/// uniform noise on top. Shared between a [`SimulatedSignal`] and a [`SimulatedDac`].
#[derive(Debug, Clone)]
pub struct CavityModel {
    pub peak: f64,
    pub background: f64,
    pub resonance: [f64; 2],
    pub width: f64,
    pub noise: f64,
    pub sample_interval: Duration,
    voltages: [f64; 6],
}

impl Default for CavityModel {
    fn default() -> Self {
        CavityModel {
            peak: 5000.0,
            background: 200.0,
            resonance: [0.05, -0.08],
            width: 0.5,
            noise: 20.0,
            sample_interval: Duration::from_millis(30),
            voltages: [0.0; 6],
        }
    }
}

impl CavityModel {
    /// Default geometry with the given peak height and noise amplitude, all voltages at zero.
    #[must_use]
    pub fn new(peak: f64, noise: f64) -> Self {
        CavityModel {
            peak,
            noise,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_sample_interval(mut self, sample_interval: Duration) -> Self {
        self.sample_interval = sample_interval;
        self
    }

    #[must_use]
    pub fn transmission(&self) -> f64 {
        let d5 = self.voltages[4] - self.resonance[0];
        let d6 = self.voltages[5] - self.resonance[1];
        self.background + self.peak * (-(d5 * d5 + d6 * d6) / (self.width * self.width)).exp()
    }

    #[must_use]
    pub fn voltages(&self) -> [f64; 6] {
        self.voltages
    }
}

pub struct SimulatedSignal {
    model: Arc<Mutex<CavityModel>>,
}

pub struct SimulatedDac {
    model: Arc<Mutex<CavityModel>>,
}

/// Source and sink sharing one simulated cavity.
#[must_use]
pub fn simulated_cavity(model: CavityModel) -> (SimulatedSignal, SimulatedDac) {
    let model = Arc::new(Mutex::new(model));
    (
        SimulatedSignal {
            model: Arc::clone(&model),
        },
        SimulatedDac { model },
    )
}

impl SignalSource for SimulatedSignal {
    fn read_signal(&mut self) -> Result<f64, HardwareError> {
        let (clean, noise, interval) = {
            let model = self.model.lock().map_err(|_| HardwareError::Poisoned)?;
            (model.transmission(), model.noise, model.sample_interval)
        };
        // stand in for the counter's gate time
        std::thread::sleep(interval);
        let jitter = if noise > 0.0 {
            rand::thread_rng().gen_range(-noise..noise)
        } else {
            0.0
        };
        Ok(clean + jitter)
    }
}

impl VoltageSink for SimulatedDac {
    fn write_voltage(&mut self, channel: usize, volts: f64) -> Result<(), HardwareError> {
        let mut model = self.model.lock().map_err(|_| HardwareError::Poisoned)?;
        if let Some(v) = channel
            .checked_sub(1)
            .and_then(|i| model.voltages.get_mut(i))
        {
            *v = volts;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), HardwareError> {
        let mut model = self.model.lock().map_err(|_| HardwareError::Poisoned)?;
        model.voltages = [0.0; 6];
        Ok(())
    }
}
