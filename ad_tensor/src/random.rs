//! Process-wide random source for tensor initialisation.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

static GENERATOR: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

/// Reseed the generator so later random tensors are reproducible.
pub fn manual_seed(seed: u64) {
    *GENERATOR.lock() = StdRng::seed_from_u64(seed);
}

/// `len` samples drawn uniformly from `[low, high)`.
pub fn uniform(len: usize, low: f32, high: f32) -> Vec<f32> {
    let mut rng = GENERATOR.lock();
    (0..len).map(|_| rng.gen_range(low..high)).collect()
}
