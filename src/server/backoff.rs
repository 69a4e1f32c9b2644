use std::time::Duration;

/// Exponential restart backoff in base 2, clamped to a maximum delay.
///
/// The first retry waits the base delay; each subsequent retry doubles it
/// until the cap is reached. Attempt zero never waits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartBackoff {
    base: Duration,
    max: Duration,
}

impl RestartBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the given retry attempt (1-indexed):
    /// `min(max, base * 2^(attempt - 1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63);
        let millis = self
            .base
            .as_millis()
            .saturating_mul(1u128 << exponent)
            .min(self.max.as_millis());
        Duration::from_millis(millis as u64)
    }
}
