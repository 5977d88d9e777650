use std::time::{Duration, Instant};

/// Minimum-interval governor for batch emission
#[derive(Clone, Debug)]
pub struct ThrottleGate {
    min_interval: Duration,
    last_emit: Instant,
}

impl ThrottleGate {
    /// The interval is measured from `now`, so the first batch waits one full interval
    pub fn new(min_interval: Duration, now: Instant) -> Self {
        Self {
            min_interval,
            last_emit: now,
        }
    }

    /// Whether enough time has passed since the last emission
    pub fn ready(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_emit) >= self.min_interval
    }

    /// Record an emission at `now`
    pub fn mark(&mut self, now: Instant) {
        self.last_emit = now;
    }
}
