#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]

use std::time::{Duration, Instant};

/// Exponentially weighted running average of the lock signal.
///
/// Each accepted sample moves the average by `1/window` of the difference. The average starts at
/// zero, so the first `window` or so samples are a warm-up. Non-finite samples are dropped; the
/// average never holds an error value.
#[derive(Debug, Clone)]
pub struct SignalAverager {
    window: u32,
    average: f64,
    samples: u64,
    last_update: Option<Instant>,
    stale_after: Option<Duration>,
}

impl Default for SignalAverager {
    fn default() -> Self {
        SignalAverager::new(20)
    }
}

impl SignalAverager {
    #[must_use]
    pub fn new(window: u32) -> Self {
        SignalAverager {
            window: window.max(1),
            average: 0.0,
            samples: 0,
            last_update: None,
            stale_after: None,
        }
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn observe(&mut self, sample: f64) {
        self.observe_at(sample, Instant::now());
    }

    pub fn observe_at(&mut self, sample: f64, now: Instant) {
        if !sample.is_finite() {
            return;
        }
        let n = f64::from(self.window);
        self.average = self.average * (n - 1.0) / n + sample / n;
        self.samples += 1;
        self.last_update = Some(now);
    }

    #[inline]
    #[must_use]
    pub fn read(&self) -> f64 {
        self.average
    }

    #[inline]
    #[must_use]
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Number of samples folded into the average so far.
    #[inline]
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// True once no sample has been accepted for longer than the configured `stale_after`. Always
    /// false when no timeout is configured.
    #[must_use]
    pub fn is_stale(&self, now: Instant) -> bool {
        match (self.stale_after, self.last_update) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(limit), Some(last)) => now.saturating_duration_since(last) > limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn closed_form(samples: &[f64], window: u32) -> f64 {
        let n = f64::from(window);
        let decay = (n - 1.0) / n;
        let k = samples.len();
        samples
            .iter()
            .enumerate()
            .map(|(i, x)| x / n * decay.powi((k - 1 - i) as i32))
            .sum()
    }

    #[test]
    fn matches_closed_form() {
        let mut rng = rand::thread_rng();
        for window in [1, 2, 5, 20, 50] {
            let mut avg = SignalAverager::new(window);
            let samples: Vec<f64> = (0..300).map(|_| rng.gen_range(0.0..5000.0)).collect();
            for (k, x) in samples.iter().enumerate() {
                avg.observe(*x);
                let expected = closed_form(&samples[..=k], window);
                assert!(
                    (avg.read() - expected).abs() <= 1e-9 * expected.abs().max(1.0),
                    "window {window}, sample {k}: {} vs {expected}",
                    avg.read()
                );
            }
            assert_eq!(avg.samples(), 300);
        }
    }

    #[test]
    fn constant_input_approaches_value() {
        let mut avg = SignalAverager::new(20);
        for _ in 0..1000 {
            avg.observe(120.0);
        }
        assert!((avg.read() - 120.0).abs() < 1e-6);
    }

    #[test]
    fn non_finite_samples_are_skipped() {
        let mut avg = SignalAverager::new(4);
        avg.observe(8.0);
        avg.observe(f64::NAN);
        avg.observe(f64::INFINITY);
        assert_eq!(avg.read(), 2.0);
        assert_eq!(avg.samples(), 1);
    }

    #[test]
    fn zero_window_behaves_as_one() {
        let mut avg = SignalAverager::new(0);
        avg.observe(3.0);
        avg.observe(7.0);
        assert_eq!(avg.read(), 7.0);
    }

    #[test]
    fn staleness() {
        let start = Instant::now();
        let avg = SignalAverager::new(20);
        assert!(!avg.is_stale(start + Duration::from_secs(100)));

        let mut avg = avg.with_stale_after(Some(Duration::from_millis(500)));
        assert!(avg.is_stale(start));
        avg.observe_at(1.0, start);
        assert!(!avg.is_stale(start + Duration::from_millis(400)));
        assert!(avg.is_stale(start + Duration::from_millis(600)));
    }
}
