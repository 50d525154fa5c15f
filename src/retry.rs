use serde::{Deserialize, Serialize};

/// Partial retry configuration. Unset fields fall back to the job-level
/// defaults when resolved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<f64>,
    pub max_delay_ms: Option<f64>,
    pub backoff_factor: Option<f64>,
    pub jitter_ratio: Option<f64>,
}

/// Fully populated retry policy with every field clamped to its valid domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: f64,
    pub max_delay_ms: f64,
    pub backoff_factor: f64,
    pub jitter_ratio: f64,
}

impl Default for ResolvedRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200.0,
            max_delay_ms: 2_000.0,
            backoff_factor: 2.0,
            jitter_ratio: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Merges this partial policy over the defaults. Fails closed: invalid or
    /// non-finite values fall back to the default instead of erroring.
    pub fn resolve(&self) -> ResolvedRetryPolicy {
        let d = ResolvedRetryPolicy::default();
        ResolvedRetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(d.max_attempts).max(1),
            initial_delay_ms: clamp_field(self.initial_delay_ms, 0.0, d.initial_delay_ms),
            max_delay_ms: clamp_field(self.max_delay_ms, 0.0, d.max_delay_ms),
            backoff_factor: clamp_field(self.backoff_factor, 1.0, d.backoff_factor),
            jitter_ratio: clamp_field(self.jitter_ratio, 0.0, d.jitter_ratio),
        }
    }
}

fn clamp_field(value: Option<f64>, floor: f64, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.max(floor),
        _ => default,
    }
}

/// Backoff delay in milliseconds before the given 1-based attempt.
///
/// Attempt 1 never waits. Attempt n (n >= 2) waits
/// `min(max_delay, initial_delay * factor^(n-2))`. With `jitter_ratio > 0`
/// the delay is scaled by a fixed function of the attempt index rather than
/// a random source, so replays stay reproducible.
pub fn compute_delay_ms(attempt: u32, policy: &ResolvedRetryPolicy) -> u64 {
    if attempt <= 1 {
        return 0;
    }
    let exp = (attempt - 2) as i32;
    let base = policy.initial_delay_ms * policy.backoff_factor.powi(exp);
    let clamped = base.min(policy.max_delay_ms);
    if policy.jitter_ratio <= 0.0 {
        return clamped.round() as u64;
    }

    let jitter = ((attempt as f64) * 999.0).sin() * 0.5 + 0.5;
    let scaled = clamped * (1.0 - policy.jitter_ratio + jitter * policy.jitter_ratio);
    scaled.round() as u64
}
