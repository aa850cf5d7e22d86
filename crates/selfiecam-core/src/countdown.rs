//! Capture countdown: ticks once per period while a face stays in view.

use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Seconds shown when a countdown cycle starts.
pub const COUNTDOWN_START: u8 = 5;

/// Next countdown value. Steps down by one and stops at zero.
pub fn step(remaining: u8) -> u8 {
    if remaining <= 1 {
        0
    } else {
        remaining - 1
    }
}

/// A running countdown with its own ticker. Dropping it cancels the ticker.
pub struct Countdown {
    remaining: u8,
    ticker: Interval,
}

impl Countdown {
    /// Start at `from`; the first decrement happens one `period` later.
    /// A zero period is raised to one millisecond.
    pub fn start(from: u8, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            remaining: from,
            ticker,
        }
    }

    pub fn remaining(&self) -> u8 {
        self.remaining
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == 0
    }

    /// Wait for the next tick without changing the value.
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }

    /// Apply one tick and return the new value.
    pub fn advance(&mut self) -> u8 {
        self.remaining = step(self.remaining);
        self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_sequence() {
        let mut seen = vec![COUNTDOWN_START];
        let mut n = COUNTDOWN_START;
        while n > 0 {
            n = step(n);
            seen.push(n);
        }
        assert_eq!(seen, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_step_never_underflows() {
        assert_eq!(step(1), 0);
        assert_eq!(step(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let start = Instant::now();
        let mut countdown = Countdown::start(COUNTDOWN_START, Duration::from_secs(1));
        assert_eq!(countdown.remaining(), 5);

        countdown.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(countdown.advance(), 4);
        assert!(!countdown.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_does_not_panic() {
        let start = Instant::now();
        let mut countdown = Countdown::start(2, Duration::ZERO);
        countdown.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1));
        assert_eq!(countdown.advance(), 1);
    }
}
