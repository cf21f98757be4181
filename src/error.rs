use std::process::ExitStatus;

use thiserror::Error;

/// Failures of the instrument collaborators. None of these are fatal to the control loop: a failed
/// read skips one averager update, a failed write is logged and retried on the next change.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unexpected reply {reply:?} to query {query:?}")]
    BadReply { query: String, reply: String },
    #[error("DAC program exited with {0}")]
    DacProgram(ExitStatus),
    #[error("simulated cavity state is poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to get key {section}:{key}")]
    Missing { section: String, key: String },
    #[error("failed to convert {section}:{key} to {expected}")]
    WrongType {
        section: String,
        key: String,
        expected: &'static str,
    },
    #[error("invalid value for {section}:{key}: {reason}")]
    Invalid {
        section: String,
        key: String,
        reason: String,
    },
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Zmq(#[from] zeromq::ZmqError),
    #[error("received a request while the reply to the previous one is still outstanding")]
    OutOfTurn,
    #[error("tried to reply without a pending request")]
    NoPendingRequest,
}
