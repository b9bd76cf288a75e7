use std::time::Duration;

use rand::Rng;

/// Default number of failed attempts before dialing gives up.
pub const DEFAULT_RETRY_LIMIT: u32 = 700;

/// Randomised exponential delays between connection attempts.
///
/// Each step computes `next = (prev + random(0, floor(0.1 * prev) + 1)) * 2`
/// units, starting from one unit.
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    limit: u32,
    prev: u64,
    attempts: u32,
}

impl Backoff {
    pub fn new(unit: Duration, limit: u32) -> Backoff {
        Backoff {
            unit,
            limit,
            prev: 1,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the limit is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.limit {
            return None;
        }
        let bound = (self.prev as f64 * 0.1) as u64 + 1;
        let jitter = rand::thread_rng().gen_range(0..bound);
        self.prev = self.prev.saturating_add(jitter).saturating_mul(2);
        self.attempts += 1;
        let units = u32::try_from(self.prev).unwrap_or(u32::MAX);
        Some(self.unit.saturating_mul(units))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
