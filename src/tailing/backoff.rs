// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Granularity of cancellable sleeps on worker threads
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Exponential backoff with jitter, bounded by `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; doubles the base delay for the one after.
    /// The delay is the base delay +/- 25%, never above `max`.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let backoff_ms = self.current.as_millis() as u64;

        // avoid div by zero
        let spread = (backoff_ms / 2).max(1);
        let jitter = rand::random::<u64>() % spread;
        let sleep_ms = (backoff_ms + jitter).saturating_sub(spread / 2);

        self.current = std::cmp::min(self.current * 2, self.max);
        Duration::from_millis(sleep_ms).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Sleep on the current thread for `duration` or until `cancel` fires.
/// Returns false if cancelled.
pub fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(75) && first < Duration::from_millis(125));

        for _ in 0..10 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_millis(400), "{:?}", d);
        }
        assert_eq!(backoff.attempts(), 11);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let d = backoff.next_delay();
        assert!(d >= Duration::from_millis(75) && d < Duration::from_millis(125));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter_of_base() {
        for _ in 0..1000 {
            let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(10));
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(150) && d < Duration::from_millis(250), "{:?}", d);
        }
    }

    #[test]
    fn test_zero_backoff_does_not_panic() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert!(backoff.next_delay() <= Duration::from_millis(1));
    }

    #[test]
    fn test_cancelled_sleep_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        assert!(!sleep_unless_cancelled(&cancel, Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));

        let live = CancellationToken::new();
        assert!(sleep_unless_cancelled(&live, Duration::from_millis(10)));
    }
}
