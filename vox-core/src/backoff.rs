//! Reconnect backoff: exponential, doubling from one unit, capped.

use std::time::Duration;

/// Default cap, in units.
pub const DEFAULT_MAX_UNITS: u32 = 30;

/// Exponential backoff schedule: 1, 2, 4, 8, 16, 30, 30, ... units (with the default cap).
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    max_units: u32,
    next_units: u32,
    attempts: u64,
}

impl Backoff {
    pub fn new(unit: Duration, max_units: u32) -> Self {
        let max_units = max_units.max(1);
        Self {
            unit,
            max_units,
            next_units: 1,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let units = self.next_units.min(self.max_units);
        self.next_units = units.saturating_mul(2).min(self.max_units);
        self.attempts = self.attempts.saturating_add(1);
        self.unit * units
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Back to one unit (call after a successful reconnect).
    pub fn reset(&mut self) {
        self.next_units = 1;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), DEFAULT_MAX_UNITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let mut b = Backoff::default();
        let secs: Vec<u64> = (0..9).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30, 30]);
        assert_eq!(b.attempts(), 9);
    }

    #[test]
    fn never_exceeds_cap() {
        let mut b = Backoff::new(Duration::from_millis(10), 30);
        for _ in 0..200 {
            assert!(b.next_delay() <= Duration::from_millis(300));
        }
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.attempts(), 1);
    }

    #[test]
    fn custom_unit_and_cap() {
        let mut b = Backoff::new(Duration::from_millis(5), 3);
        let ms: Vec<u128> = (0..4).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(ms, vec![5, 10, 15, 15]);
    }
}
