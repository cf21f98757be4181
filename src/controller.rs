#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::sync::Mutex;
use log::{info, warn};

use crate::averager::SignalAverager;
use crate::channel::{clamp_to, VoltageChannel};
use crate::history::TickLog;
use crate::lock::{LockEngine, LockError, LockSettings, LockStatus};
use crate::protocol::{
    format_value, parse_number, parse_request, parse_shift, round_milli, ProtocolError, Request,
    Shift, REPLY_OK,
};

/// Handle shared by the poller, the scheduler and the command server.
pub type SharedController = Arc<Mutex<Controller>>;

pub const NUM_CHANNELS: usize = 6;
/// Output channels carrying the lock corrections, in offset order.
pub const LOCK_CHANNELS: [usize; 2] = [5, 6];

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub min_volts: f64,
    pub max_volts: f64,
    pub max_step_volts: [f64; NUM_CHANNELS],
    /// Set-point change of one `ShiftVolt` request.
    pub shift_step_volts: f64,
    pub threshold: f64,
    pub threshold_max: f64,
    pub averaging: u32,
    pub stale_after: Option<Duration>,
    pub log_length_exponent: usize,
    pub lock: LockSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            min_volts: -10.0,
            max_volts: 10.0,
            max_step_volts: [0.1, 0.1, 0.1, 0.1, 0.05, 0.05],
            shift_step_volts: 0.01,
            threshold: 0.0,
            threshold_max: 10000.0,
            averaging: 20,
            stale_after: None,
            log_length_exponent: 10,
            lock: LockSettings::default(),
        }
    }
}

/// Everything a viewer needs to mirror the controller, taken at the end of a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tick: u64,
    pub uptime: Duration,
    pub signal: f64,
    pub signal_stale: bool,
    pub threshold: f64,
    pub target: f64,
    pub status: LockStatus,
    pub enabled: bool,
    pub requested: bool,
    pub offsets: [f64; 2],
    pub direction: i8,
    pub attempts: u32,
    pub set_points: [f64; NUM_CHANNELS],
    pub outputs: [f64; NUM_CHANNELS],
    pub late_ticks: u64,
    pub shutting_down: bool,
}

/// The complete controller state. One instance lives behind the shared mutex; the scheduler
/// drives it with [`Controller::tick`] and the command server with
/// [`Controller::process_command`].
#[derive(Debug)]
pub struct Controller {
    channels: Vec<VoltageChannel>,
    averager: SignalAverager,
    lock: LockEngine,
    threshold: f64,
    threshold_max: f64,
    shift_step: f64,
    // the average as of the end of the previous tick
    displayed_signal: f64,
    tick_counter: u64,
    late_ticks: u64,
    shutting_down: bool,
    stale_reported: bool,
    start_time: Instant,
    pub signal_log: TickLog,
    pub offset_logs: [TickLog; 2],
}

impl Controller {
    #[must_use]
    pub fn new(settings: ControllerSettings) -> Option<Self> {
        let channels = settings
            .max_step_volts
            .iter()
            .enumerate()
            .map(|(i, step)| {
                VoltageChannel::new(i + 1, *step, settings.min_volts, settings.max_volts)
            })
            .collect();
        let n = settings.log_length_exponent;
        Some(Controller {
            channels,
            averager: SignalAverager::new(settings.averaging)
                .with_stale_after(settings.stale_after),
            lock: LockEngine::new(settings.lock),
            threshold: clamp_to(settings.threshold, 0.0, settings.threshold_max),
            threshold_max: settings.threshold_max,
            shift_step: settings.shift_step_volts,
            displayed_signal: 0.0,
            tick_counter: 0,
            late_ticks: 0,
            shutting_down: false,
            stale_reported: false,
            start_time: Instant::now(),
            signal_log: TickLog::new(n)?,
            offset_logs: [TickLog::new(n)?, TickLog::new(n)?],
        })
    }

    /// Channel `number`, counted from 1.
    #[must_use]
    pub fn channel(&self, number: usize) -> Option<&VoltageChannel> {
        number.checked_sub(1).and_then(|i| self.channels.get(i))
    }

    fn channel_mut(&mut self, number: usize) -> Option<&mut VoltageChannel> {
        number.checked_sub(1).and_then(|i| self.channels.get_mut(i))
    }

    pub fn channels(&self) -> impl Iterator<Item = &VoltageChannel> {
        self.channels.iter()
    }

    /// Store a set-point and return the clamped value, or `None` for an unknown channel. While
    /// shutting down every set-point is pinned to zero.
    pub fn set_voltage(&mut self, number: usize, volts: f64) -> Option<f64> {
        let volts = if self.shutting_down { 0.0 } else { volts };
        self.channel_mut(number).map(|ch| ch.set(volts))
    }

    pub fn shift_voltage(&mut self, number: usize, shift: Shift) -> Option<f64> {
        let delta = match shift {
            Shift::Up => self.shift_step,
            Shift::Down => -self.shift_step,
        };
        let current = self.channel(number)?.set_point();
        self.set_voltage(number, current + delta)
    }

    #[must_use]
    pub fn output(&self, number: usize) -> Option<f64> {
        self.channel(number).map(VoltageChannel::output)
    }

    pub fn set_threshold(&mut self, threshold: f64) -> f64 {
        if !threshold.is_nan() {
            self.threshold = clamp_to(threshold, 0.0, self.threshold_max);
        }
        self.threshold
    }

    #[inline]
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    #[inline]
    #[must_use]
    pub fn signal(&self) -> f64 {
        self.averager.read()
    }

    /// Fold one raw signal sample into the running average.
    pub fn observe(&mut self, sample: f64) {
        self.averager.observe(sample);
    }

    pub fn observe_at(&mut self, sample: f64, now: Instant) {
        self.averager.observe_at(sample, now);
    }

    #[must_use]
    pub fn averager(&self) -> &SignalAverager {
        &self.averager
    }

    #[must_use]
    pub fn lock_engine(&self) -> &LockEngine {
        &self.lock
    }

    /// # Errors
    /// Refuses while shutting down, or when the threshold is not below the current signal.
    pub fn arm_lock(&mut self) -> Result<f64, LockError> {
        if self.shutting_down {
            return Err(LockError::ShuttingDown);
        }
        let signal = self.signal();
        self.lock.arm(self.threshold, signal)
    }

    /// Disable the lock, keeping the cavity where the search left it by moving the current
    /// corrections into the set-points of the lock channels.
    pub fn disarm_lock(&mut self) {
        let was_enabled = self.lock.is_enabled();
        let folded = self.lock.disarm();
        if !was_enabled {
            return;
        }
        for (number, offset) in LOCK_CHANNELS.into_iter().zip(folded) {
            if let Some(ch) = self.channel_mut(number) {
                ch.set(ch.set_point() + offset);
                ch.set_offset(0.0);
            }
        }
    }

    pub fn request_lock(&mut self) -> bool {
        self.lock.request()
    }

    /// Current lock status as reported to a peer. Reporting a successful lock closes the request.
    pub fn check_lock(&mut self) -> LockStatus {
        let status = self.lock.status();
        self.lock.acknowledge();
        status
    }

    /// Start the ramp-down: every set-point goes to zero and the lock is released without keeping
    /// its corrections. The scheduler keeps ticking until [`Controller::is_shut_down`].
    pub fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            info!("shutting down, ramping all outputs to zero");
        }
        self.shutting_down = true;
        self.lock.disarm();
        for ch in &mut self.channels {
            ch.set(0.0);
        }
    }

    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Shutdown was requested and every output has reached zero.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutting_down && self.channels.iter().all(|ch| ch.output() == 0.0)
    }

    pub fn record_late_tick(&mut self) {
        self.late_ticks += 1;
    }

    #[inline]
    #[must_use]
    pub fn tick_counter(&self) -> u64 {
        self.tick_counter
    }

    /// One control step: lock transition and hill-climb, then the corrections go onto the lock
    /// channels, then every channel ramps. Returns `(channel, volts)` for each output that moved.
    pub fn tick(&mut self, now: Instant) -> Vec<(usize, f64)> {
        self.tick_counter += 1;
        let signal = self.signal();

        if self.averager.is_stale(now) {
            if !self.stale_reported {
                warn!("signal average is stale, no sample accepted recently");
                self.stale_reported = true;
            }
        } else {
            self.stale_reported = false;
        }

        self.lock.step(signal, self.displayed_signal, self.threshold);
        let offsets = self.lock.offsets();
        for (number, offset) in LOCK_CHANNELS.into_iter().zip(offsets) {
            if let Some(ch) = self.channel_mut(number) {
                ch.set_offset(offset);
            }
        }

        let writes = self
            .channels
            .iter_mut()
            .filter_map(|ch| ch.step().map(|volts| (ch.number(), volts)))
            .collect();

        self.displayed_signal = signal;
        self.signal_log.push(signal);
        for (log, offset) in self.offset_logs.iter_mut().zip(offsets) {
            log.push(offset);
        }
        writes
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let mut set_points = [0.0; NUM_CHANNELS];
        let mut outputs = [0.0; NUM_CHANNELS];
        for (i, ch) in self.channels.iter().enumerate().take(NUM_CHANNELS) {
            set_points[i] = ch.set_point();
            outputs[i] = ch.output();
        }
        Snapshot {
            tick: self.tick_counter,
            uptime: now.saturating_duration_since(self.start_time),
            signal: self.signal(),
            signal_stale: self.averager.is_stale(now),
            threshold: self.threshold,
            target: self.lock.target(),
            status: self.lock.status(),
            enabled: self.lock.is_enabled(),
            requested: self.lock.is_requested(),
            offsets: self.lock.offsets(),
            direction: self.lock.direction(),
            attempts: self.lock.attempts(),
            set_points,
            outputs,
            late_ticks: self.late_ticks,
            shutting_down: self.shutting_down,
        }
    }

    /// Interpret one request from the command socket and return the reply to send back.
    pub fn process_command(&mut self, msg: &str) -> String {
        match parse_request(msg).and_then(|req| self.execute(req)) {
            Ok(reply) => reply,
            Err(e) => e.reply().to_string(),
        }
    }

    fn is_defined(channel: i64) -> bool {
        usize::try_from(channel).is_ok_and(|c| (1..=NUM_CHANNELS).contains(&c))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn execute(&mut self, req: Request<'_>) -> Result<String, ProtocolError> {
        let resp = match req {
            Request::Lock => {
                if self.request_lock() {
                    REPLY_OK.to_string()
                } else {
                    info!("lock is not set, telling the other side");
                    "Lock Nonexistent".to_string()
                }
            }
            Request::Annihilate => {
                self.begin_shutdown();
                REPLY_OK.to_string()
            }
            Request::CheckLock => match self.check_lock() {
                LockStatus::Locked => "Lock Successful",
                LockStatus::Error => "Lock Unsuccessful",
                LockStatus::Processing => "Still Locking",
                LockStatus::NoLock | LockStatus::OutOfLock => "Something Wrong",
            }
            .to_string(),
            Request::CheckVolt(channel) => match usize::try_from(channel)
                .ok()
                .filter(|_| Self::is_defined(channel))
                .and_then(|c| self.output(c))
            {
                Some(volts) => format!("Volt{channel} {}", format_value(volts)),
                None => format!("Volt{channel} Undefined"),
            },
            Request::SetVolt { channel, value } => {
                if Self::is_defined(i64::from(channel)) {
                    let volts = round_milli(parse_number(value)?);
                    let stored = self
                        .set_voltage(channel as usize, volts)
                        .ok_or(ProtocolError::Malformed)?;
                    format!("SetVolt{channel} {}", format_value(stored))
                } else {
                    format!("SetVolt{channel} Undefined")
                }
            }
            Request::ShiftVolt { channel, direction } => {
                if Self::is_defined(i64::from(channel)) {
                    let shift = parse_shift(direction)?;
                    self.shift_voltage(channel as usize, shift);
                    format!("ShiftVolt{channel} {direction}")
                } else {
                    format!("ShiftVolt{channel} Undefined")
                }
            }
            Request::SetThreshold(value) => {
                format!("SetThreshold {}", format_value(self.set_threshold(value)))
            }
            Request::ArmLock => match self.arm_lock() {
                Ok(_) => REPLY_OK.to_string(),
                Err(LockError::ThresholdTooHigh) => "Threshold Too High".to_string(),
                Err(LockError::ShuttingDown) => "Shutting Down".to_string(),
            },
            Request::DisarmLock => {
                self.disarm_lock();
                REPLY_OK.to_string()
            }
            Request::CheckSignal => format!("Signal {}", format_value(self.signal())),
        };
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    /// Controller whose average follows the last sample exactly.
    #[fixture]
    fn ctrl() -> Controller {
        Controller::new(ControllerSettings {
            averaging: 1,
            ..Default::default()
        })
        .expect("should allocate")
    }

    fn run_ticks(ctrl: &mut Controller, n: usize) {
        let now = Instant::now();
        for _ in 0..n {
            ctrl.tick(now);
        }
    }

    #[rstest]
    #[case("banana", "Speak Properly")]
    #[case("Please Dance", "Whatdahell Boss")]
    #[case("ShiftVolt7 Up", "ShiftVolt7 Undefined")]
    #[case("ShiftVolt0 Down", "ShiftVolt0 Undefined")]
    #[case("ShiftVolt2 Sideways", "Whatdahell Boss")]
    #[case("ShiftVolt2 Up", "ShiftVolt2 Up")]
    #[case("SetVolt3 4.2", "SetVolt3 4.2")]
    #[case("SetVolt3 12", "SetVolt3 10.0")]
    #[case("SetVolt1 -4.56789", "SetVolt1 -4.568")]
    #[case("SetVolt8 abc", "SetVolt8 Undefined")]
    #[case("SetVolt2 abc", "Speak Properly")]
    #[case("CheckVolt 4", "Volt4 0.0")]
    #[case("CheckVolt 7", "Volt7 Undefined")]
    #[case("CheckVolt -1", "Volt-1 Undefined")]
    #[case("Please Lock", "Lock Nonexistent")]
    #[case("Check Lock", "Something Wrong")]
    #[case("Check Signal", "Signal 0.0")]
    #[case("SetThreshold 20000", "SetThreshold 10000.0")]
    #[case("SetThreshold -5", "SetThreshold 0.0")]
    #[case("Arm Lock", "Threshold Too High")]
    #[case("Disarm Lock", "Okay Boss")]
    #[case("Please Annihilate", "Okay Boss")]
    fn replies(mut ctrl: Controller, #[case] request: &str, #[case] reply: &str) {
        assert_eq!(ctrl.process_command(request), reply);
    }

    #[rstest]
    fn set_volt_then_check_after_ramp(mut ctrl: Controller) {
        assert_eq!(ctrl.process_command("SetVolt3 4.2"), "SetVolt3 4.2");
        run_ticks(&mut ctrl, 1);
        assert_eq!(ctrl.process_command("CheckVolt 3"), "Volt3 0.1");
        run_ticks(&mut ctrl, 41);
        assert_eq!(ctrl.process_command("CheckVolt 3"), "Volt3 4.2");
        assert_eq!(ctrl.output(3), Some(4.2));
    }

    #[rstest]
    fn shift_moves_set_point_by_fine_step(mut ctrl: Controller) {
        ctrl.process_command("SetVolt2 1.0");
        ctrl.process_command("ShiftVolt2 Up");
        ctrl.process_command("ShiftVolt2 Up");
        ctrl.process_command("ShiftVolt2 Down");
        let set_point = ctrl.channel(2).unwrap().set_point();
        assert!((set_point - 1.01).abs() < 1e-12);

        ctrl.process_command("SetVolt2 10");
        ctrl.process_command("ShiftVolt2 Up");
        assert_eq!(ctrl.channel(2).unwrap().set_point(), 10.0);
    }

    #[rstest]
    fn only_changed_outputs_are_written(mut ctrl: Controller) {
        assert!(ctrl.tick(Instant::now()).is_empty());
        ctrl.set_voltage(1, 0.05);
        ctrl.set_voltage(6, -0.2);
        let writes = ctrl.tick(Instant::now());
        assert_eq!(writes, vec![(1, 0.05), (6, -0.05)]);
    }

    #[rstest]
    fn lock_conversation(mut ctrl: Controller) {
        ctrl.process_command("SetThreshold 100");
        ctrl.observe(400.0);
        assert_eq!(ctrl.process_command("Arm Lock"), "Okay Boss");
        assert_eq!(ctrl.lock_engine().target(), 250.0);
        run_ticks(&mut ctrl, 3);
        assert_eq!(ctrl.lock_engine().status(), LockStatus::NoLock);

        // signal sags between threshold and target: searching
        ctrl.observe(200.0);
        assert_eq!(ctrl.process_command("Please Lock"), "Okay Boss");
        run_ticks(&mut ctrl, 1);
        assert_eq!(ctrl.process_command("Check Lock"), "Still Locking");

        ctrl.observe(300.0);
        run_ticks(&mut ctrl, 1);
        assert_eq!(ctrl.process_command("Check Lock"), "Lock Successful");
        assert!(!ctrl.lock_engine().is_requested());

        // with the request closed, falling below threshold is reported as out of lock
        ctrl.observe(50.0);
        run_ticks(&mut ctrl, 1);
        assert_eq!(ctrl.lock_engine().status(), LockStatus::OutOfLock);
        assert_eq!(ctrl.process_command("Check Lock"), "Something Wrong");
    }

    #[rstest]
    fn exhausted_lock_reports_unsuccessful(mut ctrl: Controller) {
        ctrl.observe(400.0);
        ctrl.arm_lock().unwrap();
        ctrl.observe(150.0);
        ctrl.process_command("Please Lock");
        run_ticks(&mut ctrl, 450);
        assert_eq!(ctrl.process_command("Check Lock"), "Lock Unsuccessful");
        for offset in ctrl.lock_engine().offsets() {
            assert!((-1.0..=1.0).contains(&offset));
        }
        assert_eq!(ctrl.process_command("Please Lock"), "Okay Boss");
        assert_eq!(ctrl.process_command("Check Lock"), "Still Locking");
    }

    #[rstest]
    fn offsets_reach_lock_channels_and_fold_on_disarm(mut ctrl: Controller) {
        ctrl.observe(400.0);
        ctrl.arm_lock().unwrap();
        ctrl.observe(150.0);
        ctrl.set_voltage(6, 1.0);
        ctrl.request_lock();
        run_ticks(&mut ctrl, 50);
        let offset = ctrl.lock_engine().offsets()[1];
        assert!((offset - 0.02).abs() < 1e-12);
        assert!((ctrl.channel(6).unwrap().demand() - 1.02).abs() < 1e-12);

        ctrl.process_command("Disarm Lock");
        assert!((ctrl.channel(6).unwrap().set_point() - 1.02).abs() < 1e-12);
        run_ticks(&mut ctrl, 1);
        assert_eq!(ctrl.lock_engine().offsets(), [0.0, 0.0]);
        assert!((ctrl.channel(6).unwrap().demand() - 1.02).abs() < 1e-12);
    }

    #[rstest]
    fn shutdown_ramps_everything_to_zero(mut ctrl: Controller) {
        ctrl.process_command("SetVolt1 -3");
        ctrl.process_command("SetVolt5 2");
        run_ticks(&mut ctrl, 100);
        ctrl.observe(400.0);
        ctrl.arm_lock().unwrap();
        ctrl.request_lock();
        ctrl.observe(150.0);
        run_ticks(&mut ctrl, 60);

        assert_eq!(ctrl.process_command("Please Annihilate"), "Okay Boss");
        assert!(ctrl.is_shutting_down());
        assert!(!ctrl.is_shut_down());
        assert_eq!(ctrl.process_command("SetVolt1 5"), "SetVolt1 0.0");
        assert_eq!(ctrl.process_command("Arm Lock"), "Shutting Down");

        let mut last = [0.0; NUM_CHANNELS];
        for (i, ch) in ctrl.channels().enumerate() {
            last[i] = ch.output();
        }
        let mut ticks = 0;
        while !ctrl.is_shut_down() {
            ctrl.tick(Instant::now());
            for (i, ch) in ctrl.channels().enumerate() {
                assert!((ch.output() - last[i]).abs() <= ch.max_step() + 1e-9);
                last[i] = ch.output();
            }
            ticks += 1;
            assert!(ticks < 1000);
        }
        assert_eq!(ctrl.lock_engine().status(), LockStatus::NoLock);
        assert!(ctrl.channels().all(|ch| ch.output() == 0.0));
    }

    #[rstest]
    fn snapshot_mirrors_state(mut ctrl: Controller) {
        ctrl.process_command("SetVolt2 0.3");
        ctrl.process_command("SetThreshold 12.5");
        ctrl.observe(42.0);
        run_ticks(&mut ctrl, 2);
        ctrl.record_late_tick();
        let snap = ctrl.snapshot(Instant::now());
        assert_eq!(snap.tick, 2);
        assert_eq!(snap.signal, 42.0);
        assert_eq!(snap.threshold, 12.5);
        assert_eq!(snap.set_points[1], 0.3);
        assert!((snap.outputs[1] - 0.2).abs() < 1e-12);
        assert_eq!(snap.status, LockStatus::NoLock);
        assert_eq!(snap.late_ticks, 1);
        assert!(!snap.signal_stale);
        assert_eq!(ctrl.signal_log.last(), 42.0);
    }

    #[test]
    fn stale_signal_is_reported_once() {
        let mut ctrl = Controller::new(ControllerSettings {
            averaging: 1,
            stale_after: Some(Duration::from_millis(500)),
            ..Default::default()
        })
        .expect("should allocate");
        let start = Instant::now();
        ctrl.observe_at(100.0, start);

        ctrl.tick(start + Duration::from_millis(100));
        assert!(!ctrl.snapshot(start + Duration::from_millis(100)).signal_stale);
        assert!(!ctrl.stale_reported);

        let late = start + Duration::from_secs(1);
        ctrl.tick(late);
        assert!(ctrl.snapshot(late).signal_stale);
        assert!(ctrl.stale_reported);
        ctrl.tick(late + Duration::from_millis(100));
        assert!(ctrl.stale_reported);

        ctrl.observe_at(110.0, start + Duration::from_millis(1100));
        let fresh = start + Duration::from_millis(1200);
        ctrl.tick(fresh);
        assert!(!ctrl.stale_reported);
        assert!(!ctrl.snapshot(fresh).signal_stale);
        assert_eq!(ctrl.signal(), 110.0);
    }
}
