//! Jitter strategies to keep retrying clients from synchronizing.
//!
//! - `None`: deterministic delays, handy in tests.
//! - `Multiplicative`: scales the delay by a uniform factor in `[0.5, 1.0)`,
//!   keeping a floor of half the backoff while spreading load.
//!
//! RNG: `rand`'s thread-local generator by default; tests can inject a seeded
//! RNG via `apply_with_rng`.

use rand::{rng, Rng};
use std::time::Duration;

/// Lower bound of the multiplicative factor.
const FACTOR_MIN: f64 = 0.5;
/// Upper bound (exclusive) of the multiplicative factor.
const FACTOR_MAX: f64 = 1.0;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Use the exact backoff delay
    None,
    /// `delay * uniform(0.5, 1.0)`
    #[default]
    Multiplicative,
}

impl Jitter {
    pub fn multiplicative() -> Self {
        Jitter::Multiplicative
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-provided RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Multiplicative => {
                if delay.is_zero() {
                    return Duration::ZERO;
                }
                let factor = rng.random_range(FACTOR_MIN..FACTOR_MAX);
                delay.mul_f64(factor)
            }
        }
    }
}
