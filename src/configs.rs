#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_errors_doc
)]

use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::info;

use crate::controller::ControllerSettings;
use crate::error::ConfigError;
use crate::hardware::{
    simulated_cavity, CavityModel, DacProgram, SignalSource, UsbCounter, VoltageSink,
};
use crate::lock::{DirectionPolicy, ImprovementReference, LockSettings};
use crate::scheduler::SchedulerSettings;
use crate::util::{tomlget, tomlget_opt, tomlget_or};

pub fn load(path: &Path) -> Result<toml::Value, ConfigError> {
    let cfg_text = read_to_string(path)?;
    Ok(toml::from_str(&cfg_text)?)
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Fixed-length array under `sec:key`, or `default` if the key is absent.
fn array_or<T: Copy + std::fmt::Debug, const N: usize>(
    cfg: &toml::Value,
    sec: &str,
    key: &str,
    conv: impl Fn(&toml::Value) -> Option<T>,
    default: [T; N],
) -> Result<[T; N], ConfigError> {
    let Some(val) = cfg.get(sec).and_then(|s| s.get(key)) else {
        log::warn!("failed to find {sec}:{key} in config; proceeding with default {default:?}");
        return Ok(default);
    };
    let items = val
        .as_array()
        .ok_or_else(|| invalid(sec, key, "expected an array"))?;
    if items.len() != N {
        return Err(invalid(sec, key, format!("expected {N} entries, found {}", items.len())));
    }
    let mut out = default;
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = conv(item).ok_or_else(|| invalid(sec, key, format!("bad entry {item}")))?;
    }
    Ok(out)
}

fn parse_setting<T: FromStr<Err = String>>(
    sec: &str,
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|e: String| invalid(sec, key, e))
}

pub fn lock_from_config(cfg: &toml::Value) -> Result<LockSettings, ConfigError> {
    let defaults = LockSettings::default();
    let out = LockSettings {
        min_offset: tomlget_or!(cfg, "lock", "min_offset", as_float, f64, -1.0),
        max_offset: tomlget_or!(cfg, "lock", "max_offset", as_float, f64, 1.0),
        step_offset: tomlget_or!(cfg, "lock", "step_offset", as_float, f64, 0.002),
        locking_delay: tomlget_or!(cfg, "lock", "locking_delay", as_integer, u32, 5),
        max_locking_steps: array_or(
            cfg,
            "lock",
            "max_locking_steps",
            |v| v.as_integer().and_then(|x| u32::try_from(x).ok()),
            defaults.max_locking_steps,
        )?,
        max_locking_tries: tomlget_or!(cfg, "lock", "max_locking_tries", as_integer, u32, 6),
        start_mode: tomlget_or!(cfg, "lock", "start_mode", as_integer, u32, 1),
        direction_policy: parse_setting::<DirectionPolicy>(
            "lock",
            "direction_policy",
            tomlget_or!(cfg, "lock", "direction_policy", as_str, "reset"),
        )?,
        improvement_reference: parse_setting::<ImprovementReference>(
            "lock",
            "improvement_reference",
            tomlget_or!(cfg, "lock", "improvement_reference", as_str, "previous_tick"),
        )?,
        relock_on_drop: tomlget_or!(cfg, "lock", "relock_on_drop", as_bool, false),
    };
    if out.min_offset > out.max_offset {
        return Err(invalid("lock", "min_offset", "must not exceed max_offset"));
    }
    if out.step_offset < 0.0 {
        return Err(invalid("lock", "step_offset", "must not be negative"));
    }
    Ok(out)
}

pub fn controller_from_config(cfg: &toml::Value) -> Result<ControllerSettings, ConfigError> {
    let defaults = ControllerSettings::default();
    let out = ControllerSettings {
        min_volts: tomlget_or!(cfg, "channels", "min_volts", as_float, f64, -10.0),
        max_volts: tomlget_or!(cfg, "channels", "max_volts", as_float, f64, 10.0),
        max_step_volts: array_or(
            cfg,
            "channels",
            "max_step_volts",
            toml::Value::as_float,
            defaults.max_step_volts,
        )?,
        shift_step_volts: tomlget_or!(cfg, "channels", "shift_step_volts", as_float, f64, 0.01),
        threshold: tomlget_or!(cfg, "signal", "threshold", as_float, f64, 0.0),
        threshold_max: tomlget_or!(cfg, "signal", "threshold_max", as_float, f64, 10000.0),
        averaging: tomlget_or!(cfg, "signal", "averaging", as_integer, u32, 20),
        stale_after: tomlget_opt!(cfg, "signal", "stale_after_ms", as_integer, u64)
            .map(Duration::from_millis),
        log_length_exponent: tomlget_or!(
            cfg,
            "general",
            "log_length_exponent",
            as_integer,
            usize,
            10
        ),
        lock: lock_from_config(cfg)?,
    };
    if out.min_volts >= out.max_volts {
        return Err(invalid("channels", "min_volts", "must be below max_volts"));
    }
    // shutdown ramps every output to exactly 0 V
    if out.min_volts > 0.0 || out.max_volts < 0.0 {
        return Err(invalid("channels", "min_volts", "output range must include 0 V"));
    }
    if out.averaging == 0 {
        return Err(invalid("signal", "averaging", "window must be at least 1"));
    }
    if out.log_length_exponent > 20 {
        return Err(invalid("general", "log_length_exponent", "at most 20"));
    }
    Ok(out)
}

pub fn scheduler_from_config(cfg: &toml::Value) -> SchedulerSettings {
    SchedulerSettings {
        period: Duration::from_millis(tomlget_or!(
            cfg,
            "general",
            "tick_period_ms",
            as_integer,
            u64,
            100
        )),
        late_tick_tolerance: tomlget_or!(cfg, "general", "late_tick_tolerance", as_float, f64, 0.5),
    }
}

/// Socket endpoints and telemetry cadence from `[general]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommsSettings {
    pub command_endpoint: String,
    pub telemetry_endpoint: Option<String>,
    pub publish_every: u32,
    pub poll_interval: Duration,
}

pub fn comms_from_config(cfg: &toml::Value) -> CommsSettings {
    let address = tomlget_or!(cfg, "general", "command_address", as_str, "127.0.0.1");
    let command_port = tomlget_or!(cfg, "general", "command_port", as_integer, u16, 5556);
    CommsSettings {
        command_endpoint: format!("tcp://{address}:{command_port}"),
        telemetry_endpoint: tomlget_opt!(cfg, "general", "telemetry_port", as_integer, u16)
            .map(|port| format!("tcp://{address}:{port}")),
        publish_every: tomlget_or!(cfg, "general", "publish_every", as_integer, u32, 8),
        poll_interval: Duration::from_millis(tomlget_or!(
            cfg,
            "general",
            "server_poll_ms",
            as_integer,
            u64,
            200
        )),
    }
}

pub fn signal_retry_from_config(cfg: &toml::Value) -> Duration {
    Duration::from_millis(tomlget_or!(cfg, "signal", "retry_ms", as_integer, u64, 50))
}

/// Signal source and voltage sink named by `signal:source`: `"counter"` for the USB counter and
/// the DAC program, `"simulated"` for a simulated cavity.
pub fn hardware_from_config(
    cfg: &toml::Value,
) -> Result<(Box<dyn SignalSource>, Box<dyn VoltageSink>), ConfigError> {
    match tomlget!(cfg, "signal", "source", as_str) {
        "counter" => {
            let counter = UsbCounter::open(
                tomlget_or!(cfg, "signal", "device", as_str, "/dev/ttyACM0"),
                tomlget_or!(cfg, "signal", "counter_channel", as_integer, usize, 0),
                tomlget_or!(cfg, "signal", "gate_time_ms", as_integer, u32, 50),
            )?;
            let dac = DacProgram::new(
                tomlget_or!(cfg, "dac", "program", as_str, "~/bin/usbdacset"),
                tomlget_or!(cfg, "dac", "device", as_str, "/dev/ioboards/pattgen_serial_10"),
            );
            Ok((Box::new(counter), Box::new(dac)))
        }
        "simulated" => {
            info!("running against a simulated cavity");
            let model = CavityModel::new(
                tomlget_or!(cfg, "simulation", "peak", as_float, f64, 5000.0),
                tomlget_or!(cfg, "simulation", "noise", as_float, f64, 20.0),
            );
            let (source, sink) = simulated_cavity(model);
            Ok((Box::new(source), Box::new(sink)))
        }
        other => Err(invalid("signal", "source", format!("unknown source '{other}'"))),
    }
}
