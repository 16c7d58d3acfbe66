//! Failure classification and exponential backoff.

use crate::constants;
use regex::Regex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    RateLimit,
    Billing,
    Timeout,
    ContextOverflow,
    Unknown,
}

impl FailureReason {
    fn base_delay(self) -> Duration {
        match self {
            FailureReason::RateLimit => Duration::from_secs(60),
            FailureReason::Billing => Duration::from_secs(3600),
            FailureReason::Timeout => Duration::from_secs(60),
            FailureReason::ContextOverflow => Duration::from_secs(1800),
            FailureReason::Unknown => Duration::from_secs(300),
        }
    }
}

/// Classifies an error string by substring match, in the priority order
/// listed in the design doc's table (rate_limit checked first).
pub fn classify_failure(error_text: &str) -> FailureReason {
    let lower = error_text.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        FailureReason::RateLimit
    } else if lower.contains("billing") || lower.contains("insufficient credits") {
        FailureReason::Billing
    } else if lower.contains("timeout") || lower.contains("timed out") {
        FailureReason::Timeout
    } else if lower.contains("context length exceeded") || lower.contains("context overflow") {
        FailureReason::ContextOverflow
    } else {
        FailureReason::Unknown
    }
}

/// Base delay for a classified failure, honoring the rate-limit
/// "reset after Ns" override (clamped to a 10 s floor).
pub fn base_delay(reason: FailureReason, error_text: &str) -> Duration {
    if reason == FailureReason::RateLimit {
        if let Some(seconds) = parse_reset_after(error_text) {
            return Duration::from_secs(seconds).max(constants::RATE_LIMIT_BACKOFF_FLOOR);
        }
    }
    reason.base_delay()
}

fn parse_reset_after(text: &str) -> Option<u64> {
    let re = Regex::new(r"(?i)reset after (\d+)\s*s").ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Backoff for 0-indexed attempt `n`: `base` at n=0, doubling thereafter,
/// capped at `constants::BACKOFF_CAP`.
pub fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let multiplier = u32::try_from(multiplier).unwrap_or(u32::MAX);
    base.checked_mul(multiplier)
        .unwrap_or(constants::BACKOFF_CAP)
        .min(constants::BACKOFF_CAP)
}

/// Per-(agent, task) failure counter. Resets to zero on any recorded success.
#[derive(Debug, Default, Clone)]
pub struct FailureTracker {
    pub attempt: u32,
}

impl FailureTracker {
    pub fn record_failure(&mut self, error_text: &str) -> Duration {
        let reason = classify_failure(error_text);
        let base = base_delay(reason, error_text);
        let delay = backoff_for_attempt(base, self.attempt);
        self.attempt += 1;
        delay
    }

    pub fn record_success(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_substrings() {
        assert_eq!(classify_failure("HTTP 429 too many requests"), FailureReason::RateLimit);
        assert_eq!(classify_failure("insufficient credits on account"), FailureReason::Billing);
        assert_eq!(classify_failure("request timed out"), FailureReason::Timeout);
        assert_eq!(classify_failure("context length exceeded"), FailureReason::ContextOverflow);
        assert_eq!(classify_failure("a wild gremlin appeared"), FailureReason::Unknown);
    }

    /// Boundary: "reset after 5s" clamps up to the 10 s floor.
    #[test]
    fn rate_limit_reset_after_clamps_to_floor() {
        let reason = classify_failure("429: reset after 5s");
        let delay = base_delay(reason, "429: reset after 5s");
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn rate_limit_reset_after_honors_larger_values() {
        let reason = classify_failure("429: reset after 90s");
        let delay = base_delay(reason, "429: reset after 90s");
        assert_eq!(delay, Duration::from_secs(90));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        assert_eq!(backoff_for_attempt(base, 0), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(base, 1), Duration::from_secs(120));
        assert_eq!(backoff_for_attempt(base, 2), Duration::from_secs(240));
        assert_eq!(backoff_for_attempt(Duration::from_secs(3600), 10), constants::BACKOFF_CAP);
    }

    /// A persistently-failing agent's attempt counter can climb past 32; the
    /// shift no longer fits in the u32 multiplier but must still cap, not reset.
    #[test]
    fn backoff_caps_instead_of_collapsing_past_32_attempts() {
        let base = Duration::from_secs(60);
        assert_eq!(backoff_for_attempt(base, 32), constants::BACKOFF_CAP);
        assert_eq!(backoff_for_attempt(base, 63), constants::BACKOFF_CAP);
    }

    #[test]
    fn tracker_resets_attempt_count_on_success() {
        let mut tracker = FailureTracker::default();
        tracker.record_failure("timeout");
        tracker.record_failure("timeout");
        assert_eq!(tracker.attempt, 2);
        tracker.record_success();
        assert_eq!(tracker.attempt, 0);
    }
}
