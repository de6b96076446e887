//! Backoff policies for idle polling, broker errors and retry delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How long to wait before the next attempt.
///
/// Attempts are counted from 1 (the first delay after the first empty poll or
/// the first error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay every time.
    Fixed { delay: Duration },

    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    ///
    /// `jitter` is the fraction (0.0..=1.0) of the computed delay that may be
    /// randomly shaved off, so concurrent workers do not poll in lockstep.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    },
}

impl BackoffPolicy {
    /// Fixed delay.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Exponential backoff without jitter.
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier,
            max,
            jitter: 0.0,
        }
    }

    /// Builder method to set the jitter fraction. No-op on fixed policies.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        if let Self::Exponential { jitter, .. } = &mut self {
            *jitter = fraction;
        }
        self
    }

    /// Check the parameters make sense.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Fixed { .. } => Ok(()),
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(CoreError::InvalidBackoff(format!(
                        "multiplier must be >= 1.0, got {multiplier}"
                    )));
                }
                if max < initial {
                    return Err(CoreError::InvalidBackoff(format!(
                        "max ({max:?}) is below initial ({initial:?})"
                    )));
                }
                if !(0.0..=1.0).contains(jitter) {
                    return Err(CoreError::InvalidBackoff(format!(
                        "jitter must be within 0.0..=1.0, got {jitter}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Upper bound of any delay this policy produces.
    pub fn ceiling(&self) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { max, .. } => *max,
        }
    }

    /// Delay before attempt `attempt + 1`. `attempt` 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                let capped = if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::from_secs_f64(secs.max(0.0))
                } else {
                    *max
                };
                apply_jitter(capped, *jitter)
            }
        }
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = jitter.min(1.0);
    let shave = rand::thread_rng().gen_range(0.0..=fraction);
    delay.mul_f64(1.0 - shave)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2))
    }
}
