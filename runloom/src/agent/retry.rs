//! Retry policy with two independent axes.
//!
//! Generic provider failures back off exponentially (×2 per retry, capped);
//! rate-limit failures get their own gentler schedule (×1.5 per retry,
//! capped, with ±20 % jitter against thundering herds). Rate-limit detection
//! prefers the typed [`super::ProviderError::RateLimited`] kind and falls
//! back to a substring match, because upstream provider errors are not
//! reliably typed.

use std::time::Duration;

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

const RATE_LIMIT_BASE_BACKOFF: Duration = Duration::from_secs(30);
const RATE_LIMIT_MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Step-level retry configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per step for generic failures (1 means no retry).
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts per step specifically for rate-limit errors.
    pub rate_limit_max_attempts: u32,
    pub rate_limit_base_backoff: Duration,
    pub rate_limit_max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            rate_limit_max_attempts: 3,
            rate_limit_base_backoff: RATE_LIMIT_BASE_BACKOFF,
            rate_limit_max_backoff: RATE_LIMIT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Fill zero values with defaults and repair inverted bounds. Callers
    /// may leave any field unset; normalization always produces a usable
    /// policy.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.max_attempts < 1 {
            self.max_attempts = 1;
        }
        if self.base_backoff.is_zero() {
            self.base_backoff = DEFAULT_BASE_BACKOFF;
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        if self.rate_limit_max_attempts == 0 {
            self.rate_limit_max_attempts = 3;
        }
        if self.rate_limit_base_backoff.is_zero() {
            self.rate_limit_base_backoff = RATE_LIMIT_BASE_BACKOFF;
        }
        if self.rate_limit_max_backoff.is_zero() {
            self.rate_limit_max_backoff = RATE_LIMIT_MAX_BACKOFF;
        }
        if self.rate_limit_max_backoff < self.rate_limit_base_backoff {
            self.rate_limit_max_backoff = self.rate_limit_base_backoff;
        }
        self
    }

    /// Backoff before the `retry_number`-th generic retry (1-indexed):
    /// base, then ×2 per retry, capped at `max_backoff`.
    #[must_use]
    pub fn backoff_for_attempt(&self, retry_number: u32) -> Duration {
        let retry_number = retry_number.max(1);
        let mut delay = self.base_backoff;
        for _ in 1..retry_number {
            delay *= 2;
            if delay >= self.max_backoff {
                return self.max_backoff;
            }
        }
        delay.min(self.max_backoff)
    }

    /// Backoff before the `retry_number`-th rate-limit retry: base, then
    /// ×1.5 per retry, capped, then ±20 % jitter. `jitter_unit` is a
    /// uniform sample in `[0, 1)` supplied by the caller so tests stay
    /// deterministic.
    #[must_use]
    pub fn rate_limit_backoff_for_attempt(&self, retry_number: u32, jitter_unit: f64) -> Duration {
        let retry_number = retry_number.max(1);
        let mut delay = self.rate_limit_base_backoff;
        for _ in 1..retry_number {
            delay = delay * 3 / 2;
            if delay >= self.rate_limit_max_backoff {
                delay = self.rate_limit_max_backoff;
                break;
            }
        }
        if delay > self.rate_limit_max_backoff {
            delay = self.rate_limit_max_backoff;
        }
        let jitter_factor = 1.0 + (jitter_unit.clamp(0.0, 1.0) * 0.4 - 0.2);
        delay.mul_f64(jitter_factor)
    }
}

/// Substring fallback for rate-limit detection on untyped provider errors.
#[must_use]
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("429")
        || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_fills_zero_values() {
        let policy = RetryPolicy {
            max_attempts: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            rate_limit_max_attempts: 0,
            rate_limit_base_backoff: Duration::ZERO,
            rate_limit_max_backoff: Duration::ZERO,
        }
        .normalize();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn normalize_repairs_inverted_bounds() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        }
        .normalize();
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn generic_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(2));
    }

    #[test]
    fn rate_limit_backoff_grows_gently_with_jitter_bounds() {
        let policy = RetryPolicy::default();
        // jitter_unit 0.5 is the midpoint: no jitter applied.
        assert_eq!(
            policy.rate_limit_backoff_for_attempt(1, 0.5),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.rate_limit_backoff_for_attempt(2, 0.5),
            Duration::from_secs(45)
        );
        // Extremes stay within ±20 %.
        let low = policy.rate_limit_backoff_for_attempt(1, 0.0);
        let high = policy.rate_limit_backoff_for_attempt(1, 0.999_999);
        assert_eq!(low, Duration::from_secs(24));
        assert!(high <= Duration::from_secs(36));
        assert!(high >= Duration::from_secs(35));
        // Cap applies before jitter.
        assert_eq!(
            policy.rate_limit_backoff_for_attempt(10, 0.5),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn substring_detection_matches_common_patterns() {
        assert!(is_rate_limit_message("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_message("provider rate_limit_exceeded"));
        assert!(is_rate_limit_message("Rate Limit hit, slow down"));
        assert!(!is_rate_limit_message("connection reset by peer"));
    }
}
