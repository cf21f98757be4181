#![warn(clippy::pedantic)]

/// Fixed-size log of one value per control tick, published with the telemetry so a viewer can plot
/// the recent lock history. Length is always `2^n`; new values overwrite the oldest. It starts
/// zero-filled rather than empty, so every published frame has the same size.
/// NOTE: positions are reduced with `& (len - 1)`, which equals `% len` for a power of two.
#[derive(Debug, Clone)]
pub struct TickLog {
    n: usize,
    posn: usize,
    data: Vec<f64>,
}

impl TickLog {
    /// Logs longer than 2^20 entries are refused.
    #[must_use]
    pub fn new(n: usize) -> Option<Self> {
        if n > 20 {
            return None;
        }
        Some(TickLog {
            n,
            posn: (1 << n) - 1,
            data: vec![0.0; 1 << n],
        })
    }

    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn exponent(&self) -> usize {
        self.n
    }

    pub fn push(&mut self, val: f64) {
        self.posn = self.posn.wrapping_add(1);
        let mask = self.len() - 1;
        self.data[self.posn & mask] = val;
    }

    #[must_use]
    pub fn last(&self) -> f64 {
        self.data[self.posn & (self.len() - 1)]
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        let mask = self.len() - 1;
        (0..self.len()).map(move |i| self.data[(self.posn + 1 + i) & mask])
    }

    /// Little-endian bytes, oldest first; the layout of a telemetry frame.
    pub fn le_bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.iter().flat_map(f64::to_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        let log = TickLog::new(8).expect("should allocate");
        assert_eq!(log.len(), 256);
        assert_eq!(log.exponent(), 8);
        assert_eq!(TickLog::new(0).expect("should allocate").len(), 1);
        assert!(TickLog::new(24).is_none());
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn oldest_first() {
        let mut log = TickLog::new(3).expect("should allocate");
        assert!(log.iter().all(|x| x == 0.0));
        for i in 0..10 {
            log.push(i as f64);
        }
        let values: Vec<f64> = log.iter().collect();
        let expected: Vec<f64> = (2..10).map(|x| x as f64).collect();
        assert_eq!(values, expected);
        assert_eq!(log.last(), 9.0);
        assert_eq!(log.iter().len(), 8);
    }

    #[test]
    fn byte_layout() {
        let mut log = TickLog::new(1).expect("should allocate");
        log.push(1.5);
        log.push(-2.0);
        let bytes: Vec<u8> = log.le_bytes().collect();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[..8], 1.5f64.to_le_bytes());
        assert_eq!(bytes[8..], (-2.0f64).to_le_bytes());
    }
}
