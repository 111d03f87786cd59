use std::thread;
use std::time::Duration;

/// Number of busy queries before a card is considered stuck.
pub const BUSY_POLL_ATTEMPTS: usize = 1000;
pub const BUSY_POLL_INTERVAL: Duration = Duration::from_micros(10);

// Counts attempts up to a fixed maximum, sleeping `interval` between them.
pub struct PollCounter {
    attempt: usize,
    max_attempts: usize,
    interval: Duration,
}

impl PollCounter {
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            interval,
        }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Advances to the next attempt; false once all attempts are used up.
    pub fn tick_next(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        if self.attempt > 0 && !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
        self.attempt += 1;
        true
    }
}

/// Calls `busy` until it reports false, at most `max_attempts` times. Returns whether the
/// condition cleared.
pub fn poll_until_idle<F, E>(
    max_attempts: usize,
    interval: Duration,
    mut busy: F,
) -> Result<bool, E>
where
    F: FnMut() -> Result<bool, E>,
{
    let mut counter = PollCounter::new(max_attempts, interval);
    while counter.tick_next() {
        if !busy()? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_stops_at_max() {
        let mut counter = PollCounter::new(3, Duration::ZERO);
        assert!(counter.tick_next());
        assert!(counter.tick_next());
        assert!(counter.tick_next());
        assert!(!counter.tick_next());
        assert_eq!(counter.attempt(), 3);
    }

    #[test]
    fn poll() {
        let mut remaining = 2;
        let cleared = poll_until_idle::<_, ()>(5, Duration::ZERO, || {
            remaining -= 1;
            Ok(remaining >= 0)
        });
        assert_eq!(cleared, Ok(true));

        let never = poll_until_idle::<_, ()>(5, Duration::ZERO, || Ok(true));
        assert_eq!(never, Ok(false));

        let failing = poll_until_idle(5, Duration::ZERO, || Err("gone"));
        assert_eq!(failing, Err("gone"));
    }
}
