//! Jittered exponential backoff.
//!
//! A [`BackoffPolicy`] maps an attempt counter to a delay. It holds no state of its own, so the
//! same policy value is shared by every caller that needs it. For the reconnect calibration the
//! delays are roughly:
//!
//! * 1.6 seconds
//! * 3.2 seconds
//! * 6.4 seconds
//! * 12.8 seconds
//! * 25.6 seconds
//! * ...
//! * 8 minutes
//!
//! Each delay then has between 0 and 50% added, so the first retry lands anywhere between 1.6 and
//! 2.4 seconds.

use std::time::Duration;

use rand::Rng as _;

/// Delay for exponent zero.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound (exclusive) of the random fraction added to each delay.
pub const MAX_JITTER: f64 = 0.5;

const RECONNECT_OFFSET: u32 = 4;
const RECONNECT_CAP_EXPONENT: u32 = 13;

const REPLAY_OFFSET: u32 = 4;
const REPLAY_CAP_EXPONENT: u32 = 11;
const REPLAY_MAX_DELAY: Duration = Duration::from_secs(20);

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay produced by exponent zero
    pub base: Duration,
    /// Added to the attempt counter before exponentiation so early attempts are not too fast
    pub offset: u32,
    /// Largest exponent ever applied; attempts beyond it keep the same un-jittered delay
    pub cap_exponent: u32,
    /// Ceiling for the un-jittered delay
    pub max_delay: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(offset: u32, cap_exponent: u32, max_delay: Duration) -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            offset,
            cap_exponent,
            max_delay,
        }
    }

    /// Calibration used between socket reconnect attempts.
    #[must_use]
    pub const fn reconnect(max_delay: Duration) -> Self {
        Self::new(RECONNECT_OFFSET, RECONNECT_CAP_EXPONENT, max_delay)
    }

    /// Calibration used between `Event.replay` retries.
    #[must_use]
    pub const fn replay() -> Self {
        Self::new(REPLAY_OFFSET, REPLAY_CAP_EXPONENT, REPLAY_MAX_DELAY)
    }

    #[must_use]
    pub fn exponent(&self, attempt: u32) -> u32 {
        attempt.saturating_add(self.offset).min(self.cap_exponent)
    }

    /// The un-jittered term: `min(base * 2^exponent, max_delay)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(self.exponent(attempt)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// The base delay with a fresh random jitter in `[0, MAX_JITTER)` applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.0..MAX_JITTER);
        self.delay_with_jitter(attempt, jitter)
    }

    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "Jitter is a fractional multiplier of the base delay"
    )]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.0, MAX_JITTER);
        self.base_delay(attempt).mul_f64(1.0 + jitter)
    }
}
