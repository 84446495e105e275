use std::time::Duration;

/// Exponential delay: `base * 2^attempt`, capped at `max`.
///
/// `attempt` is zero-based, so the first retry waits `base`.
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}
