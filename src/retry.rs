//! Per-artifact retry scheduling: exponential backoff with jitter, and the
//! floors that keep the agent from hammering a rate-limited or momentarily
//! slow origin.

use std::time::Duration;

use rand::Rng;

const BASE_DELAY: Duration = Duration::from_secs(120);
const MAX_DELAY: Duration = Duration::from_secs(30 * 60);
const JITTER_FRACTION: f64 = 0.20;
const MIN_DELAY: Duration = Duration::from_secs(10);
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(5 * 60);
const TIMEOUT_FLOOR: Duration = Duration::from_secs(2 * 60);

/// Computes the next backoff delay for the `attempts`-th consecutive
/// failure (1-indexed), given the failing error's display text.
///
/// `delay = min(30 min, 120s * 2^(attempts-1))`, then ±20% uniform jitter
/// floored at 10s, then floored further to 5 minutes for rate-limit
/// indications or 2 minutes for timeout indications.
#[must_use]
pub fn backoff_delay(attempts: u32, error_text: &str) -> Duration {
    backoff_delay_with_rng(attempts, error_text, &mut rand::thread_rng())
}

fn backoff_delay_with_rng(attempts: u32, error_text: &str, rng: &mut impl Rng) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let exponential = BASE_DELAY
        .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY);

    let jitter_span = exponential.as_secs_f64() * JITTER_FRACTION;
    let jitter = rng.gen_range(-jitter_span..=jitter_span);
    let jittered_secs = (exponential.as_secs_f64() + jitter).max(0.0);
    let mut delay = Duration::from_secs_f64(jittered_secs).max(MIN_DELAY);

    let lower = error_text.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("too many requests") {
        delay = delay.max(RATE_LIMIT_FLOOR);
    } else if lower.contains("timeout") || lower.contains("timed out") {
        delay = delay.max(TIMEOUT_FLOOR);
    }

    delay
}

/// Truncates an error message to the 500-character limit the control plane
/// accepts for persisted/reported error text.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    const LIMIT: usize = 500;
    if message.len() <= LIMIT {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(LIMIT).collect();
    while !message.is_char_boundary(truncated.len()) {
        truncated.pop();
    }
    truncated
}
