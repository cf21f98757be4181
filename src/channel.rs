#![warn(clippy::pedantic)]

/// Closest allowed value to `number` in `[min, max]`. Used for every operator-supplied voltage and
/// every lock correction; out-of-range requests are never an error.
#[inline]
#[must_use]
pub fn clamp_to(number: f64, min: f64, max: f64) -> f64 {
    number.max(min).min(max)
}

/// Remaining distance (in volts) below which the ramp snaps exactly onto its demand instead of
/// taking one more full step. Absorbs float drift from summing many `max_step` increments.
const SNAP_TOLERANCE: f64 = 1e-9;

/// One analog output. Holds the operator set-point, the lock correction added on top of it, and
/// the voltage actually issued to hardware. The issued voltage only ever moves by `max_step` per
/// tick.
#[derive(Debug, Clone)]
pub struct VoltageChannel {
    number: usize,
    set_point: f64,
    offset: f64,
    output: f64,
    max_step: f64,
    min_volts: f64,
    max_volts: f64,
}

impl VoltageChannel {
    #[must_use]
    pub fn new(number: usize, max_step: f64, min_volts: f64, max_volts: f64) -> Self {
        VoltageChannel {
            number,
            set_point: 0.0,
            offset: 0.0,
            output: 0.0,
            max_step: max_step.abs(),
            min_volts,
            max_volts,
        }
    }

    /// Store a new set-point, clamped to the channel range. Returns the value actually stored.
    pub fn set(&mut self, target: f64) -> f64 {
        if !target.is_nan() {
            self.set_point = clamp_to(target, self.min_volts, self.max_volts);
        }
        self.set_point
    }

    #[inline]
    pub fn set_offset(&mut self, offset: f64) {
        if offset.is_finite() {
            self.offset = offset;
        }
    }

    /// The voltage the ramp is heading for: set-point plus lock correction, clamped once more.
    #[inline]
    #[must_use]
    pub fn demand(&self) -> f64 {
        clamp_to(self.set_point + self.offset, self.min_volts, self.max_volts)
    }

    /// Advance `output` toward `demand()` by at most `max_step`. Returns the newly issued voltage
    /// if it changed, `None` if the channel was already settled.
    pub fn step(&mut self) -> Option<f64> {
        let demand = self.demand();
        let remaining = demand - self.output;
        if remaining == 0.0 {
            return None;
        }
        if remaining.abs() <= self.max_step + SNAP_TOLERANCE {
            self.output = demand;
        } else {
            self.output += self.max_step.copysign(remaining);
        }
        Some(self.output)
    }

    #[inline]
    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }
    #[inline]
    #[must_use]
    pub fn set_point(&self) -> f64 {
        self.set_point
    }
    #[inline]
    #[must_use]
    pub fn offset(&self) -> f64 {
        self.offset
    }
    #[inline]
    #[must_use]
    pub fn output(&self) -> f64 {
        self.output
    }
    #[inline]
    #[must_use]
    pub fn max_step(&self) -> f64 {
        self.max_step
    }

    #[inline]
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.output == self.demand()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn ticks_to_settle(ch: &mut VoltageChannel) -> u32 {
        let mut ticks = 0;
        let mut last = ch.output();
        while let Some(out) = ch.step() {
            assert!((out - last).abs() <= ch.max_step() + SNAP_TOLERANCE);
            last = out;
            ticks += 1;
            assert!(ticks < 100_000, "ramp never settled");
        }
        ticks
    }

    #[test]
    fn converges_without_overshoot() {
        for (start, target, step, expected) in [
            (0.0, 4.2, 0.1, 42),
            (0.0, -3.0, 0.05, 60),
            (0.0, 0.25, 0.1, 3),
            (2.0, -2.0, 0.1, 40),
        ] {
            let mut ch = VoltageChannel::new(1, step, -10.0, 10.0);
            ch.set(start);
            ticks_to_settle(&mut ch);
            ch.set(target);
            let lower = start.min(target);
            let upper = start.max(target);
            let mut ticks = 0;
            while let Some(out) = ch.step() {
                assert!(out >= lower && out <= upper, "overshoot to {out}");
                ticks += 1;
            }
            assert_eq!(ticks, expected);
            assert_eq!(ch.output(), target);
        }
    }

    #[test]
    fn random_targets_settle_in_ceil_ticks() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let step = rng.gen_range(0.01..0.5);
            let target = rng.gen_range(-10.0..10.0);
            let mut ch = VoltageChannel::new(3, step, -10.0, 10.0);
            ch.set(target);
            let ticks = ticks_to_settle(&mut ch);
            // the last full step snaps onto the target when within the tolerance of it
            let expected = ((target.abs() - SNAP_TOLERANCE) / step).ceil().max(1.0) as u32;
            assert_eq!(ticks, expected, "target {target} step {step}");
            assert_eq!(ch.output(), target);
        }
    }

    #[test]
    fn settled_channel_issues_nothing() {
        let mut ch = VoltageChannel::new(2, 0.1, -10.0, 10.0);
        assert_eq!(ch.step(), None);
        ch.set(0.05);
        assert_eq!(ch.step(), Some(0.05));
        assert_eq!(ch.step(), None);
        assert!(ch.is_settled());
    }

    #[test]
    fn set_points_are_clamped() {
        let mut ch = VoltageChannel::new(4, 0.1, -10.0, 10.0);
        assert_eq!(ch.set(12.5), 10.0);
        assert_eq!(ch.set(-11.0), -10.0);
        assert_eq!(ch.set(f64::NAN), -10.0);
    }

    #[test]
    fn offset_adds_to_demand_within_range() {
        let mut ch = VoltageChannel::new(6, 0.05, -10.0, 10.0);
        ch.set(1.0);
        ch.set_offset(0.25);
        assert!((ch.demand() - 1.25).abs() < 1e-12);
        ch.set(9.9);
        ch.set_offset(0.5);
        assert_eq!(ch.demand(), 10.0);
    }
}
