#![warn(clippy::pedantic)]
//! Request grammar of the command socket.
//!
//! Every request is exactly two tokens separated by a single space, and every request gets exactly
//! one reply. Parsing is split from execution so that each step reports an explicit
//! [`ProtocolError`]; execution lives in [`crate::controller::Controller::process_command`].
//!
//! | Request               | Replies                                                          |
//! |-----------------------|------------------------------------------------------------------|
//! | `Please Lock`         | `Okay Boss`, `Lock Nonexistent`                                  |
//! | `Please Annihilate`   | `Okay Boss`                                                      |
//! | `Check Lock`          | `Lock Successful`, `Lock Unsuccessful`, `Still Locking`, `Something Wrong` |
//! | `CheckVolt X`         | `VoltX Y`, `VoltX Undefined`                                     |
//! | `SetVoltX Y`          | `SetVoltX Y`, `SetVoltX Undefined`                               |
//! | `ShiftVoltX Up/Down`  | `ShiftVoltX Up`, `ShiftVoltX Down`, `ShiftVoltX Undefined`       |
//! | `SetThreshold Y`      | `SetThreshold Y`                                                 |
//! | `Arm Lock`            | `Okay Boss`, `Threshold Too High`, `Shutting Down`               |
//! | `Disarm Lock`         | `Okay Boss`                                                      |
//! | `Check Signal`        | `Signal Y`                                                       |

use thiserror::Error;

/// Reply to a request that is not two space-separated tokens or carries an unparsable number.
pub const REPLY_MALFORMED: &str = "Speak Properly";
/// Reply to a well-formed request with an unknown verb.
pub const REPLY_UNRECOGNIZED: &str = "Whatdahell Boss";
pub const REPLY_OK: &str = "Okay Boss";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request")]
    Malformed,
    #[error("unrecognized request")]
    Unrecognized,
}

impl ProtocolError {
    #[must_use]
    pub fn reply(self) -> &'static str {
        match self {
            ProtocolError::Malformed => REPLY_MALFORMED,
            ProtocolError::Unrecognized => REPLY_UNRECOGNIZED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Up,
    Down,
}

/// A parsed request. Channel numbers are kept as sent; range checks happen on execution so that
/// an undefined channel is reported before its argument is looked at.
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    Lock,
    Annihilate,
    CheckLock,
    CheckVolt(i64),
    SetVolt { channel: u32, value: &'a str },
    ShiftVolt { channel: u32, direction: &'a str },
    SetThreshold(f64),
    ArmLock,
    DisarmLock,
    CheckSignal,
}

/// # Errors
/// [`ProtocolError::Malformed`] for anything but two space-separated tokens or for an unparsable
/// channel/number, [`ProtocolError::Unrecognized`] for an unknown verb.
pub fn parse_request(msg: &str) -> Result<Request<'_>, ProtocolError> {
    let mut tokens = msg.split(' ');
    let (Some(verb), Some(arg), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(ProtocolError::Malformed);
    };
    match (verb, arg) {
        ("Please", "Lock") => Ok(Request::Lock),
        ("Please", "Annihilate") => Ok(Request::Annihilate),
        ("Check", "Lock") => Ok(Request::CheckLock),
        ("Check", "Signal") => Ok(Request::CheckSignal),
        ("Arm", "Lock") => Ok(Request::ArmLock),
        ("Disarm", "Lock") => Ok(Request::DisarmLock),
        ("CheckVolt", x) => {
            #[allow(clippy::cast_possible_truncation)]
            let channel = parse_finite(x)?.trunc() as i64;
            Ok(Request::CheckVolt(channel))
        }
        ("SetThreshold", x) => Ok(Request::SetThreshold(parse_number(x)?)),
        (verb, arg) => {
            if let Some(channel) = channel_suffix(verb, "SetVolt")? {
                Ok(Request::SetVolt {
                    channel,
                    value: arg,
                })
            } else if let Some(channel) = channel_suffix(verb, "ShiftVolt")? {
                Ok(Request::ShiftVolt {
                    channel,
                    direction: arg,
                })
            } else {
                Err(ProtocolError::Unrecognized)
            }
        }
    }
}

/// `SetVolt3` -> `Some(3)`. The channel is always a single trailing character; a longer or
/// missing suffix is a different verb altogether.
fn channel_suffix(verb: &str, prefix: &str) -> Result<Option<u32>, ProtocolError> {
    let Some(rest) = verb.strip_prefix(prefix) else {
        return Ok(None);
    };
    let mut chars = rest.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => c
            .to_digit(10)
            .map(Some)
            .ok_or(ProtocolError::Malformed),
        _ => Ok(None),
    }
}

/// Any float except NaN; infinities are left for the clamps to deal with.
///
/// # Errors
/// [`ProtocolError::Malformed`] if `x` is not a number.
pub fn parse_number(x: &str) -> Result<f64, ProtocolError> {
    match x.parse::<f64>() {
        Ok(v) if !v.is_nan() => Ok(v),
        _ => Err(ProtocolError::Malformed),
    }
}

fn parse_finite(x: &str) -> Result<f64, ProtocolError> {
    parse_number(x).and_then(|v| {
        if v.is_finite() {
            Ok(v)
        } else {
            Err(ProtocolError::Malformed)
        }
    })
}

/// # Errors
/// [`ProtocolError::Unrecognized`] for anything but `Up` or `Down`.
pub fn parse_shift(direction: &str) -> Result<Shift, ProtocolError> {
    match direction {
        "Up" => Ok(Shift::Up),
        "Down" => Ok(Shift::Down),
        _ => Err(ProtocolError::Unrecognized),
    }
}

/// Round to millivolts for the wire: shortest form, always with a decimal point (`4.2`, `5.0`).
#[must_use]
pub fn format_value(value: f64) -> String {
    let rounded = round_milli(value);
    if rounded.fract() == 0.0 {
        format!("{rounded:.1}")
    } else {
        format!("{rounded}")
    }
}

#[inline]
#[must_use]
pub fn round_milli(value: f64) -> f64 {
    let rounded = (value * 1000.0).round() / 1000.0;
    // avoid replying "-0.0"
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}
