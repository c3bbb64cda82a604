//! Seeded bootstrap resampling for the bagging strategy.

use rand::prelude::*;
use rand::SeedableRng;

/// Draw `n` indices in `0..n` with replacement from a seeded RNG.
///
/// Each bagging member trains on the subset addressed by one such draw; the
/// seed is part of the member's provenance so runs reproduce exactly.
pub fn bootstrap_indices(n: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_n_indices_in_range() {
        let idx = bootstrap_indices(100, 42);
        assert_eq!(idx.len(), 100);
        assert!(idx.iter().all(|&i| i < 100));
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        assert_eq!(bootstrap_indices(50, 7), bootstrap_indices(50, 7));
        assert_ne!(bootstrap_indices(50, 7), bootstrap_indices(50, 8));
    }

    #[test]
    fn resampling_duplicates_on_average() {
        // A bootstrap draw leaves about 1/e of indices unused.
        let idx = bootstrap_indices(1000, 3);
        let mut seen = vec![false; 1000];
        for &i in &idx {
            seen[i] = true;
        }
        let unique = seen.iter().filter(|&&s| s).count();
        assert!(unique > 500 && unique < 800);
    }
}
