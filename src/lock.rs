#![warn(clippy::pedantic)]

use std::fmt;
use std::str::FromStr;

use log::{debug, info};
use thiserror::Error;

use crate::channel::clamp_to;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    #[default]
    NoLock,
    Processing,
    Locked,
    Error,
    OutOfLock,
}

impl LockStatus {
    /// Numeric code used on the telemetry socket.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            LockStatus::NoLock => 0,
            LockStatus::Processing => 1,
            LockStatus::Locked => 2,
            LockStatus::Error => 3,
            LockStatus::OutOfLock => 4,
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::NoLock => write!(f, "No lock"),
            LockStatus::Processing => write!(f, "Processing"),
            LockStatus::Locked => write!(f, "Locked"),
            LockStatus::Error => write!(f, "ERROR"),
            LockStatus::OutOfLock => write!(f, "OUT OF LOCK"),
        }
    }
}

/// What happens to the search direction when a new lock attempt starts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DirectionPolicy {
    #[default]
    Reset,
    Preserve,
}

/// The average the current signal is compared against when deciding whether the last offset
/// step helped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ImprovementReference {
    /// The average as it stood at the end of the previous tick.
    #[default]
    PreviousTick,
    /// The average recorded at the previous direction evaluation, `locking_delay` ticks ago.
    PreviousWindow,
}

impl FromStr for DirectionPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset" => Ok(DirectionPolicy::Reset),
            "preserve" => Ok(DirectionPolicy::Preserve),
            _ => Err(format!("unknown direction policy '{s}'")),
        }
    }
}

impl FromStr for ImprovementReference {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "previous_tick" => Ok(ImprovementReference::PreviousTick),
            "previous_window" => Ok(ImprovementReference::PreviousWindow),
            _ => Err(format!("unknown improvement reference '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("threshold is not below the current signal, unable to lock")]
    ThresholdTooHigh,
    #[error("controller is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub min_offset: f64,
    pub max_offset: f64,
    pub step_offset: f64,
    /// Ticks between two offset steps, giving the averaged signal time to respond.
    pub locking_delay: u32,
    /// Ticks spent on each offset channel before switching to the other one.
    pub max_locking_steps: [u32; 2],
    /// Channel switches allowed before an attempt is declared failed.
    pub max_locking_tries: u32,
    /// Initial `locking_mode`; its parity selects which offset is searched first (1: channel 6).
    pub start_mode: u32,
    pub direction_policy: DirectionPolicy,
    pub improvement_reference: ImprovementReference,
    /// Drop from `Locked` back into `Processing` when the signal falls below target while the lock
    /// is still requested.
    pub relock_on_drop: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            min_offset: -1.0,
            max_offset: 1.0,
            step_offset: 0.002,
            locking_delay: 5,
            max_locking_steps: [50, 100],
            max_locking_tries: 6,
            start_mode: 1,
            direction_policy: DirectionPolicy::Reset,
            improvement_reference: ImprovementReference::PreviousTick,
            relock_on_drop: false,
        }
    }
}

/// Threshold-triggered lock acquisition with a slow hill-climb on the two offset channels.
#[derive(Debug, Clone, Default)]
pub struct LockEngine {
    pub settings: LockSettings,
    enabled: bool,
    requested: bool,
    status: LockStatus,
    target: f64,
    offsets: [f64; 2],
    direction: i8,
    delay_counter: u32,
    step_counter: u32,
    locking_mode: u32,
    window_reference: Option<f64>,
}

impl LockEngine {
    #[must_use]
    pub fn new(settings: LockSettings) -> Self {
        let locking_mode = settings.start_mode;
        LockEngine {
            settings,
            direction: 1,
            locking_mode,
            ..Default::default()
        }
    }

    /// Enable the lock. The target is fixed here, halfway between `threshold` and the current
    /// `signal`, and stays put for as long as the lock remains armed.
    ///
    /// # Errors
    /// Refuses with [`LockError::ThresholdTooHigh`] unless `threshold < signal`.
    pub fn arm(&mut self, threshold: f64, signal: f64) -> Result<f64, LockError> {
        if self.enabled {
            return Ok(self.target);
        }
        if threshold < signal {
            self.enabled = true;
            self.target = (threshold + signal) / 2.0;
            info!("lock armed, target set at {:.1}", self.target);
            Ok(self.target)
        } else {
            Err(LockError::ThresholdTooHigh)
        }
    }

    /// Disable the lock and hand back the offsets held at that moment, so the caller can fold them
    /// into the channel set-points. The offsets themselves are zeroed on the next tick.
    pub fn disarm(&mut self) -> [f64; 2] {
        if self.enabled {
            info!("lock disarmed");
        }
        self.enabled = false;
        self.requested = false;
        self.target = 0.0;
        self.offsets
    }

    /// A remote peer asks for a lock attempt. Returns false (and records nothing) when the lock is
    /// not armed.
    pub fn request(&mut self) -> bool {
        if !self.enabled {
            self.requested = false;
            return false;
        }
        self.requested = true;
        self.begin_attempt();
        if self.status == LockStatus::Error {
            info!("trying to lock again");
            self.status = LockStatus::Processing;
        }
        true
    }

    /// The peer has been told about a successful lock; stop treating it as an open request.
    pub fn acknowledge(&mut self) {
        if self.status == LockStatus::Locked {
            self.requested = false;
        }
    }

    fn begin_attempt(&mut self) {
        self.locking_mode = self.settings.start_mode;
        self.step_counter = 0;
        self.delay_counter = 0;
        self.window_reference = None;
        if self.settings.direction_policy == DirectionPolicy::Reset {
            self.direction = 1;
        }
    }

    /// One control tick. `signal` is the live average, `previous_signal` the average as it stood at
    /// the end of the previous tick.
    pub fn step(&mut self, signal: f64, previous_signal: f64, threshold: f64) {
        if !self.enabled {
            self.status = LockStatus::NoLock;
            self.offsets = [0.0, 0.0];
            self.target = 0.0;
            return;
        }

        if self.requested {
            match self.status {
                LockStatus::NoLock | LockStatus::OutOfLock => {
                    self.status = LockStatus::Processing;
                }
                LockStatus::Locked if self.settings.relock_on_drop && signal < self.target => {
                    debug!("signal dropped below target, searching again");
                    self.begin_attempt();
                    self.status = LockStatus::Processing;
                }
                _ => {}
            }
            if self.status == LockStatus::Processing && signal > self.target {
                info!("locked at {signal:.1} (target {:.1})", self.target);
                self.status = LockStatus::Locked;
            }
        } else if signal < threshold && self.status != LockStatus::Error {
            self.status = LockStatus::OutOfLock;
        }

        if self.status == LockStatus::Processing {
            self.climb(signal, previous_signal);
            if self.attempts() >= self.settings.max_locking_tries {
                info!("lock attempt exhausted after {} tries", self.attempts());
                self.status = LockStatus::Error;
            }
        }

        for offset in &mut self.offsets {
            *offset = clamp_to(*offset, self.settings.min_offset, self.settings.max_offset);
        }
    }

    fn climb(&mut self, signal: f64, previous_signal: f64) {
        let phase = self.try_phase();
        self.delay_counter += 1;
        if self.delay_counter >= self.settings.locking_delay {
            let reference = match self.settings.improvement_reference {
                ImprovementReference::PreviousTick => Some(previous_signal),
                ImprovementReference::PreviousWindow => self.window_reference,
            };
            if reference.is_some_and(|r| signal < r) {
                self.direction = -self.direction;
            }
            self.offsets[phase] += self.settings.step_offset * f64::from(self.direction);
            self.delay_counter = 0;
            self.window_reference = Some(signal);
        }
        self.step_counter += 1;
        if self.step_counter >= self.settings.max_locking_steps[phase] {
            self.locking_mode += 1;
            self.step_counter = 0;
            debug!("trying locking with the other offset channel");
        }
    }

    /// Index into `offsets` currently being searched: 0 for channel 5, 1 for channel 6.
    #[inline]
    #[must_use]
    pub fn try_phase(&self) -> usize {
        (self.locking_mode % 2) as usize
    }

    /// Completed channel switches in the current attempt.
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.locking_mode.saturating_sub(self.settings.start_mode)
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> LockStatus {
        self.status
    }
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
    #[inline]
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested
    }
    #[inline]
    #[must_use]
    pub fn target(&self) -> f64 {
        self.target
    }
    #[inline]
    #[must_use]
    pub fn offsets(&self) -> [f64; 2] {
        self.offsets
    }
    #[inline]
    #[must_use]
    pub fn direction(&self) -> i8 {
        self.direction
    }
}
