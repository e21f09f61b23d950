use std::thread;
use std::time::Duration;

/// Bounded sleep-and-recheck loop.
///
/// The condition is checked up to `attempts` times with `interval` sleeps between checks. No
/// sleep follows the final check, so an exhausted policy blocks for
/// `(attempts - 1) * interval` plus the time spent in the checks themselves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
        }
    }

    /// Single check, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::from_millis(0))
    }

    /// Returns `true` as soon as `done` returns `true`, `false` once the attempts are used up.
    pub fn poll<F: FnMut() -> bool>(&self, mut done: F) -> bool {
        for attempt in 0..self.attempts {
            if done() {
                return true;
            }
            if attempt + 1 < self.attempts {
                thread::sleep(self.interval);
            }
        }
        false
    }
}
