//! Retry policy: decides backoff delays.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jitter multiplies the raw delay by a factor drawn from this range.
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

/// How the raw delay grows with the retry count.
///
/// Parsing never fails: an unknown name falls back to `Exponential`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

impl BackoffStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
        }
    }
}

impl From<&str> for BackoffStrategy {
    fn from(s: &str) -> Self {
        match s {
            "exponential" => BackoffStrategy::Exponential,
            "linear" => BackoffStrategy::Linear,
            "fixed" => BackoffStrategy::Fixed,
            other => {
                tracing::warn!(strategy = other, "unknown backoff strategy, using exponential");
                BackoffStrategy::Exponential
            }
        }
    }
}

impl From<String> for BackoffStrategy {
    fn from(s: String) -> Self {
        BackoffStrategy::from(s.as_str())
    }
}

impl From<BackoffStrategy> for String {
    fn from(strategy: BackoffStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

/// Backoff settings for failed tasks. Delays are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    pub base_delay: u64,
    pub max_delay: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: 2,
            max_delay: 300,
        }
    }
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy, base_delay: u64, max_delay: u64) -> Self {
        Self {
            strategy,
            base_delay,
            max_delay,
        }
    }

    /// Delay before jitter and clamping, `None` on overflow.
    ///
    /// `retry_count` is the number of prior failures (0-based).
    pub fn raw_delay(&self, retry_count: u32) -> Option<u64> {
        match self.strategy {
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(retry_count)?;
                // shifts >= 64 are rejected above; the product can still overflow
                self.base_delay.checked_mul(factor)
            }
            BackoffStrategy::Linear => {
                let steps = u64::from(retry_count).checked_add(1)?;
                self.base_delay.checked_mul(steps)
            }
            BackoffStrategy::Fixed => Some(self.base_delay),
        }
    }

    /// `backoff_delay` with this policy.
    pub fn delay_for(&self, retry_count: u32) -> u64 {
        backoff_delay(retry_count, self)
    }
}

/// Backoff delay in seconds for the given retry count, with jitter.
///
/// The result always lies in `[1, max(1, max_delay)]`.
pub fn backoff_delay(retry_count: u32, policy: &RetryPolicy) -> u64 {
    backoff_delay_with(retry_count, policy, &mut rand::thread_rng())
}

/// Same as [`backoff_delay`] with the random source supplied by the caller.
pub fn backoff_delay_with<R: Rng + ?Sized>(
    retry_count: u32,
    policy: &RetryPolicy,
    rng: &mut R,
) -> u64 {
    let ceiling = policy.max_delay.max(1);

    let Some(raw) = policy.raw_delay(retry_count) else {
        tracing::warn!(
            retry_count,
            strategy = policy.strategy.as_str(),
            base_delay = policy.base_delay,
            "backoff overflowed, falling back to base delay"
        );
        return policy.base_delay.clamp(1, ceiling);
    };

    let factor: f64 = rng.gen_range(JITTER_MIN..=JITTER_MAX);
    let jittered = raw as f64 * factor;
    let clamped = jittered.min(ceiling as f64).max(1.0);

    // truncation toward zero; `clamped` is finite and within [1, ceiling]
    (clamped as u64).clamp(1, ceiling)
}
