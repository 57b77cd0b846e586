//! Pause between connect attempts.
//!
//! Disabled by default: a connect timeout is already a pause, so attempts
//! run back to back unless `base_delay_ms` is configured.

use std::time::Duration;
use rand::Rng;

/// Delay before attempt `next_attempt` (2 for the first retry).
///
/// Doubles from `base` and is capped at `cap`. Jitter shaves up to 10% off
/// the delay so it never exceeds the cap.
pub fn connect_backoff(next_attempt: u32, base: Duration, cap: Duration) -> Duration {
    if next_attempt < 2 || base.is_zero() {
        return Duration::ZERO;
    }

    let factor = 2u32.saturating_pow(next_attempt - 2);
    let delay = base.saturating_mul(factor).min(cap);

    let jitter_ms = (delay.as_millis() / 10) as u64;
    if jitter_ms == 0 {
        return delay;
    }
    delay - Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
