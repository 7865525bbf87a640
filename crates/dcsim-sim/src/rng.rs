//! Deterministic random number generation.
//!
//! One `SimRng` per simulation feeds every random decision: network loss,
//! jitter, reordering, synchrony violations and protocol timer jitter. The
//! generator is ChaCha8, whose output stream is fixed across platforms and
//! releases, so a seed reproduces a run exactly.

use rand::{Rng as _, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded random number generator for simulations.
#[derive(Debug, Clone)]
pub struct SimRng {
    inner: ChaCha8Rng,
    seed: u64,
}

impl SimRng {
    /// Creates a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Returns the seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generates a random `u64`.
    pub fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    /// Generates a random `f64` in `[0.0, 1.0)`.
    pub fn next_f64(&mut self) -> f64 {
        self.inner.r#gen::<f64>()
    }

    /// Returns `true` with the given probability.
    ///
    /// A probability of `0.0` never fires and `1.0` always fires.
    pub fn next_bool_with_probability(&mut self, probability: f64) -> bool {
        self.next_f64() < probability
    }

    /// Draws uniformly from `[low, high)`; returns `low` when the range is empty.
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        low + (high - low) * self.next_f64()
    }
}
