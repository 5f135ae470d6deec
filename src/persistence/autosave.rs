use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    pub interval_seconds: u64,
}

impl AutosaveConfig {
    pub fn interval(self) -> Option<Duration> {
        if self.interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.interval_seconds.max(1)))
        }
    }
}

/// Cadence bookkeeping for the periodic player store. Interval 0 disables
/// autosave entirely.
#[derive(Debug, Clone)]
pub struct AutosaveState {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl AutosaveState {
    pub fn new(config: AutosaveConfig, now: Instant) -> Self {
        let interval = config.interval();
        let next_due = interval.map(|interval| now + interval);
        Self { interval, next_due }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.next_due.map_or(false, |next| now >= next)
    }

    pub fn mark_saved(&mut self, now: Instant) {
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
    }
}
