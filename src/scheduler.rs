#![warn(clippy::pedantic)]
//! The two periodic tasks: the signal poller feeding the averager, and the control tick that
//! steps the controller, writes the outputs and publishes telemetry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::task;
use futures::StreamExt;
use log::{debug, info, warn};

use crate::communications::Telemetry;
use crate::controller::SharedController;
use crate::hardware::{SignalSource, VoltageSink};

/// Raised once the outputs are safely at zero; every task exits at its next check.
pub type StopFlag = Arc<AtomicBool>;

/// Handler for an interrupt: raising `stop` makes the next tick ramp every output down.
pub fn interrupt_handler(stop: StopFlag) -> impl FnMut() + Send + 'static {
    move || {
        warn!("interrupted, ramping outputs down");
        stop.store(true, Ordering::Relaxed);
    }
}

/// Read samples until stopped, then reset the source. Each read runs on the blocking pool; a
/// failed read is skipped and retried after `retry`.
pub async fn poll_signal<S>(
    mut source: S,
    shared: SharedController,
    stop: StopFlag,
    retry: Duration,
) where
    S: SignalSource + 'static,
{
    while !stop.load(Ordering::Relaxed) {
        let (returned, reading) = task::spawn_blocking(move || {
            let reading = source.read_signal();
            (source, reading)
        })
        .await;
        source = returned;
        match reading {
            Ok(sample) => shared.lock().await.observe(sample),
            Err(e) => {
                debug!("failed to read signal: {e}");
                task::sleep(retry).await;
            }
        }
    }
    if let Err(e) = task::spawn_blocking(move || source.reset()).await {
        warn!("failed to reset signal source: {e}");
    }
    info!("signal poller stopped");
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub period: Duration,
    /// Fraction of `period` a tick may arrive late before it is counted.
    pub late_tick_tolerance: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            period: Duration::from_millis(100),
            late_tick_tolerance: 0.5,
        }
    }
}

pub struct Scheduler<K: VoltageSink> {
    shared: SharedController,
    sink: Option<K>,
    telemetry: Option<Telemetry>,
    stop: StopFlag,
    settings: SchedulerSettings,
}

impl<K: VoltageSink + 'static> Scheduler<K> {
    #[must_use]
    pub fn new(
        shared: SharedController,
        sink: K,
        telemetry: Option<Telemetry>,
        stop: StopFlag,
        settings: SchedulerSettings,
    ) -> Self {
        Scheduler {
            shared,
            sink: Some(sink),
            telemetry,
            stop,
            settings,
        }
    }

    fn late_limit(&self) -> Duration {
        self.settings
            .period
            .mul_f64(1.0 + self.settings.late_tick_tolerance.max(0.0))
    }

    /// Tick every `period` until the controller has shut down. Raising the stop flag from
    /// outside starts the shutdown; the flag is raised again here once the outputs are at zero.
    /// Returns the voltage sink.
    pub async fn run(mut self) -> Option<K> {
        let mut interval = async_std::stream::interval(self.settings.period);
        let mut last_tick = Instant::now();
        info!("entering control loop, period {:?}", self.settings.period);
        while interval.next().await.is_some() {
            let now = Instant::now();
            let spacing = now.saturating_duration_since(last_tick);
            last_tick = now;
            if self.tick_once(now, spacing).await {
                break;
            }
        }
        self.sink
    }

    /// One scheduled tick. `spacing` is the time since the previous one. Returns true once
    /// shutdown is complete.
    pub async fn tick_once(&mut self, now: Instant, spacing: Duration) -> bool {
        let (writes, frames, shut_down) = {
            let mut ctrl = self.shared.lock().await;
            if self.stop.load(Ordering::Relaxed) && !ctrl.is_shutting_down() {
                ctrl.begin_shutdown();
            }
            if spacing > self.late_limit() {
                ctrl.record_late_tick();
                warn!(
                    "late tick {}: {spacing:?} since the previous one",
                    ctrl.tick_counter() + 1
                );
            }
            let writes = ctrl.tick(now);
            let frames = self
                .telemetry
                .as_ref()
                .filter(|t| t.should_publish(ctrl.tick_counter()))
                .map(|t| t.frames(&ctrl, now));
            (writes, frames, ctrl.is_shut_down())
        };

        if !writes.is_empty() {
            self.write_outputs(writes).await;
        }
        if let (Some(telemetry), Some(frames)) = (self.telemetry.as_mut(), frames) {
            if let Err(e) = telemetry.publish(frames).await {
                warn!("failed to publish telemetry: {e}");
            }
        }

        let busy = now.elapsed();
        if busy > self.settings.period {
            warn!("tick overran its period: took {busy:?}");
        }

        if shut_down {
            if let Some(sink) = self.sink.as_mut() {
                if let Err(e) = sink.reset() {
                    warn!("failed to reset voltage outputs: {e}");
                }
            }
            self.stop.store(true, Ordering::Relaxed);
            info!("all outputs at zero, stopping");
        }
        shut_down
    }

    async fn write_outputs(&mut self, writes: Vec<(usize, f64)>) {
        let Some(mut sink) = self.sink.take() else {
            return;
        };
        let sink = task::spawn_blocking(move || {
            for (channel, volts) in writes {
                if let Err(e) = sink.write_voltage(channel, volts) {
                    warn!("failed to write {volts:.3} V to channel {channel}: {e}");
                }
            }
            sink
        })
        .await;
        self.sink = Some(sink);
    }
}
