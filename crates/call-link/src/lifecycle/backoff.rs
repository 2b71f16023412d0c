//! Exponential backoff shared by every retry path

use std::time::Duration;

/// Fixed growth factor between attempts
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Backoff curve with a base delay and a cap
///
/// `delay(attempt) = min(base * 2^(attempt-1), max)` for `attempt >= 1`.
/// Deterministic: no jitter, so both simulated and real clocks agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
}

impl BackoffCalculator {
    /// Create a curve
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before the given attempt (1-indexed; 0 is treated as 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(delay_ms(attempt, self.base_ms, self.max_ms))
    }

    /// Base delay in milliseconds
    pub fn base_ms(&self) -> u64 {
        self.base_ms
    }

    /// Cap in milliseconds
    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }
}

/// Pure backoff function in milliseconds
pub fn delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.max(1) - 1;
    // 2^63 already overflows any realistic base, so clamp the shift
    let factor = if exponent >= 63 {
        u64::MAX
    } else {
        BACKOFF_MULTIPLIER.pow(exponent)
    };
    base_ms.saturating_mul(factor).min(max_ms)
}
