//! Logging setup and rate limiting.
//!
//! The analyzer logs through the `log` facade with `env_logger` as the
//! backend. High-frequency error paths (malformed MQTT payloads, decode
//! failures on busy brokers) go through a [`LogThrottle`] so a misbehaving
//! gateway cannot flood the log.

use std::time::{Duration, Instant};

/// Initializes the logger with the `env_logger` crate.
pub fn init_logger() {
    env_logger::init();
}

/// Token-bucket-style rate limiter for log lines.
///
/// Each window grants a fixed budget of messages; once spent, further
/// messages are suppressed until the window rolls over. A decode error on
/// a 1000-packet/s broker would otherwise produce a log line per packet.
#[derive(Debug)]
pub struct LogThrottle {
    /// Window length
    window: Duration,
    /// Messages granted per window
    budget: u32,
    /// Unspent messages in the current window
    remaining: u32,
    /// When the current window rolls over
    window_ends: Instant,
}

impl LogThrottle {
    /// Create a throttle granting `budget` messages per `window_ms`.
    pub fn new(window_ms: u64, budget: u32) -> Self {
        let window = Duration::from_millis(window_ms);
        Self {
            window,
            budget,
            remaining: budget,
            window_ends: Instant::now() + window,
        }
    }

    /// Spend one message from the budget.
    ///
    /// Returns `true` if the message should be logged, `false` if it
    /// should be suppressed. Rolls the window over lazily.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.window_ends {
            self.window_ends = now + self.window;
            self.remaining = self.budget;
        }
        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                true
            }
            None => false,
        }
    }

    /// Refill the budget and start a fresh window immediately.
    pub fn reset(&mut self) {
        self.remaining = self.budget;
        self.window_ends = Instant::now() + self.window;
    }
}

/// Log a warning with throttling.
#[macro_export]
macro_rules! log_warn_throttled {
    ($throttle:expr, $($arg:tt)*) => {
        if $throttle.allow() {
            log::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_throttle_basic() {
        let mut throttle = LogThrottle::new(1000, 3);

        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(throttle.allow());

        // budget spent, 4th message inside the window is suppressed
        assert!(!throttle.allow());
        assert!(!throttle.allow());
    }

    #[test]
    fn test_log_throttle_reset() {
        let mut throttle = LogThrottle::new(1000, 2);

        assert!(throttle.allow());
        assert!(throttle.allow());
        assert!(!throttle.allow());

        throttle.reset();
        assert!(throttle.allow());
    }

    #[test]
    fn test_log_throttle_window_rollover() {
        let mut throttle = LogThrottle::new(10, 1);
        assert!(throttle.allow());
        assert!(!throttle.allow());

        std::thread::sleep(Duration::from_millis(15));
        assert!(throttle.allow());
    }
}
