//! Log throttling for hot loops
//!
//! Per-frame failures (a corrupt sample, a malformed packet) can repeat
//! dozens of times a second. A [`LogThrottle`] lets the first one through
//! and then at most one per interval, reporting how many were swallowed.

use std::time::{Duration, Instant};

/// Rate limit for one recurring log message, owned by a single loop
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether to log this occurrence. Returns the number of occurrences
    /// suppressed since the last one logged, or `None` to stay quiet.
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::with_secs(5)
    }
}
