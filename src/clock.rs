use std::sync::Mutex;

use chrono::Local;

use crate::model::Stamp;

/// Source of "now" in facility-local time. The gate reads it once per attempt.
pub trait Clock: Send + Sync {
    fn now(&self) -> Stamp;
}

/// Wall clock of the host, read in its local timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Stamp {
        Local::now().naive_local()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<Stamp>,
}

impl FixedClock {
    pub fn new(now: Stamp) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: Stamp) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Stamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn fixed_clock_set_and_advance() {
        let t = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let clock = FixedClock::new(t);
        assert_eq!(clock.now(), t);
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(clock.now(), t + chrono::Duration::hours(2));
        clock.set(t);
        assert_eq!(clock.now(), t);
    }
}
