//! Escalating cooldown policy
//!
//! A throttled key sits out `base × min(2^(k−1), cap_multiplier)` where `k` is
//! its current run of consecutive failures. The duration only depends on `k`,
//! so the schedule is testable without a clock.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Longest a key can be pushed out by a single penalty or spacing interval.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cooldown tuning for throttled and quota-exhausted credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    /// Cooldown after the first consecutive throttle.
    pub base: Duration,
    /// Ceiling on the doubling factor.
    pub cap_multiplier: u32,
    /// How long a quota-exhausted key is pushed out (it also stays excluded
    /// until the daily reset).
    pub quota_window: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap_multiplier: 8,
            quota_window: Duration::from_secs(3600),
        }
    }
}

impl CooldownPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.base.is_zero() {
            return Err(Error::InvalidPolicy("cooldown base must be non-zero".into()));
        }
        if self.cap_multiplier == 0 {
            return Err(Error::InvalidPolicy(
                "cooldown cap multiplier must be at least 1".into(),
            ));
        }
        let longest = self.base.checked_mul(self.cap_multiplier);
        if longest.is_none_or(|d| d > MAX_COOLDOWN) {
            return Err(Error::InvalidPolicy(format!(
                "cooldown base × cap multiplier must not exceed {}s",
                MAX_COOLDOWN.as_secs()
            )));
        }
        if self.quota_window > MAX_COOLDOWN {
            return Err(Error::InvalidPolicy(format!(
                "quota window must not exceed {}s",
                MAX_COOLDOWN.as_secs()
            )));
        }
        Ok(())
    }

    /// Cooldown for a key that has now failed `consecutive_failures` times in a row.
    ///
    /// Zero is treated as one so a penalty always imposes at least `base`.
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.max(1) - 1;
        let doubling = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let multiplier = doubling.min(u64::from(self.cap_multiplier.max(1)));
        // multiplier <= cap_multiplier, which is a u32
        self.base.saturating_mul(multiplier as u32).min(MAX_COOLDOWN)
    }
}

/// `now + wait`, with `wait` capped at [`MAX_COOLDOWN`] so the instant never overflows.
pub(crate) fn deadline(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait.min(MAX_COOLDOWN)).unwrap_or(now)
}
