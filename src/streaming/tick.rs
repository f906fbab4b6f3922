//! Coarse periodic tick
//!
//! The redundant external driver of the service operation. Missed periods are
//! coalesced into a single firing, the way a throttled host timer behaves.

use std::time::{Duration, Instant};

/// Interval timer polled with explicit instants
#[derive(Debug, Clone)]
pub struct PeriodicTick {
    interval: Duration,
    next_due: Option<Instant>,
    armed: bool,
}

impl PeriodicTick {
    /// Create a disarmed tick
    pub fn new(interval: Duration) -> Self {
        PeriodicTick {
            interval: interval.max(Duration::from_millis(1)),
            next_due: None,
            armed: false,
        }
    }

    /// Start ticking; the first firing is one interval after the next poll
    pub fn arm(&mut self) {
        if !self.armed {
            self.armed = true;
            self.next_due = None;
        }
    }

    /// Stop ticking
    pub fn disarm(&mut self) {
        self.armed = false;
        self.next_due = None;
    }

    /// Whether the tick is armed
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Tick period
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true at most once per poll when a period has elapsed
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.armed {
            return false;
        }
        let Some(due) = self.next_due else {
            self.next_due = Some(now + self.interval);
            return false;
        };
        if now < due {
            return false;
        }

        // Next due point is the first period boundary strictly after `now`
        let into_period = now.duration_since(due).as_nanos() % self.interval.as_nanos();
        self.next_due = Some(now + self.interval - Duration::from_nanos(into_period as u64));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarmed_never_fires() {
        let mut tick = PeriodicTick::new(Duration::from_millis(4));
        let start = Instant::now();
        assert!(!tick.poll(start));
        assert!(!tick.poll(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_fires_each_interval() {
        let mut tick = PeriodicTick::new(Duration::from_millis(4));
        tick.arm();
        let start = Instant::now();

        assert!(!tick.poll(start), "first poll only schedules");
        assert!(!tick.poll(start + Duration::from_millis(3)));
        assert!(tick.poll(start + Duration::from_millis(4)));
        assert!(!tick.poll(start + Duration::from_millis(5)));
        assert!(tick.poll(start + Duration::from_millis(8)));
    }

    #[test]
    fn test_missed_periods_coalesce() {
        let mut tick = PeriodicTick::new(Duration::from_millis(4));
        tick.arm();
        let start = Instant::now();
        tick.poll(start);

        assert!(tick.poll(start + Duration::from_millis(100)));
        assert!(
            !tick.poll(start + Duration::from_millis(101)),
            "a long gap fires once, not once per missed period"
        );
        assert!(tick.poll(start + Duration::from_millis(104)));
    }

    #[test]
    fn test_long_gap_stays_on_period_grid() {
        let mut tick = PeriodicTick::new(Duration::from_millis(4));
        tick.arm();
        let start = Instant::now();
        tick.poll(start);

        assert!(tick.poll(start + Duration::from_secs(3600) + Duration::from_millis(1)));
        assert!(!tick.poll(start + Duration::from_secs(3600) + Duration::from_millis(3)));
        assert!(tick.poll(start + Duration::from_secs(3600) + Duration::from_millis(4)));
    }

    #[test]
    fn test_disarm_stops_ticks() {
        let mut tick = PeriodicTick::new(Duration::from_millis(4));
        tick.arm();
        let start = Instant::now();
        tick.poll(start);
        tick.disarm();
        assert!(!tick.is_armed());
        assert!(!tick.poll(start + Duration::from_millis(8)));
    }
}
