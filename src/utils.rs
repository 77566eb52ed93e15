use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub fn new_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

pub fn ln_factorial(n: usize) -> f64 {
    (2..=n).map(|i| (i as f64).ln()).sum()
}

/// Index drawn proportionally to `weights`; `None` when nothing has
/// positive finite mass.
pub fn sample_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if !(total > 0.0) || !total.is_finite() {
        return None;
    }
    let u = rng.gen_range(0.0..total);
    let mut acc = 0.0;
    let mut last = None;
    for (i, &w) in weights.iter().enumerate() {
        if !(w.is_finite() && w > 0.0) {
            continue;
        }
        acc += w;
        last = Some(i);
        if u < acc {
            return Some(i);
        }
    }
    last
}
