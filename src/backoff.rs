use rand::Rng;
use std::time::Duration;

const BASE: Duration = Duration::from_millis(100);
const CAP: Duration = Duration::from_secs(60);
const GROWTH_FACTOR: f64 = 1.25;
const JITTER_FRACTION: f64 = 0.03;

/// Computes the delay before the next connection attempt.
///
/// `failed_attempts` is the number of consecutive establish failures seen so
/// far (starting at 1). The raw delay grows exponentially from 100ms by a
/// factor of 1.25 per failure and is capped at 60s; a uniform jitter of
/// ±3% is applied afterwards, with the cap re-applied so the returned value
/// never exceeds 60s.
pub(crate) fn connection_backoff(failed_attempts: usize) -> Duration {
    // The cap is reached by attempt 30; clamping before the i32 cast
    // keeps huge failure counts from truncating into a negative exponent.
    let exponent = failed_attempts.saturating_sub(1).min(64) as i32;
    let raw = (BASE.as_secs_f64() * GROWTH_FACTOR.powi(exponent)).min(CAP.as_secs_f64());

    let jitter = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let jittered = raw * (1.0 + jitter);

    Duration::from_secs_f64(jittered.min(CAP.as_secs_f64()))
}
