//! Thompson sampling with an exploration floor
//!
//! For each candidate a `theta ~ Beta(alpha, beta)` is drawn from its current
//! posterior and the argmax wins. Equal thetas go to the arm with fewer
//! observations. With probability `epsilon` the argmax is overridden by one
//! of the other candidates chosen uniformly, so exploration never drops below
//! `epsilon` even once the posteriors have converged.

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use super::posterior::Posterior;
use super::store::BanditStore;
use crate::arms::Arm;
use crate::error::{Error, Result};

/// Default exploration floor
pub const DEFAULT_EPSILON: f64 = 0.10;

/// Outcome of one selection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub arm: Arm,
    /// Theta drawn for the selected arm
    pub sampled_prob: f64,
    /// Whether the epsilon override replaced the argmax
    pub explored: bool,
}

/// Stateless Thompson sampler; the posterior state lives in [`BanditStore`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ThompsonSampler;

impl ThompsonSampler {
    /// Pick one arm from `candidates`, loading their posteriors from `store`.
    ///
    /// `rng` is injected so selection is reproducible under a fixed seed.
    pub async fn select<R: Rng + ?Sized>(
        candidates: &[Arm],
        store: &BanditStore,
        epsilon: f64,
        rng: &mut R,
    ) -> Result<Selection> {
        let posteriors = store.get_or_init_many(candidates).await?;
        Self::select_from(candidates, &posteriors, epsilon, rng)
    }

    /// Selection over already-loaded posteriors (same order as `candidates`)
    pub fn select_from<R: Rng + ?Sized>(
        candidates: &[Arm],
        posteriors: &[Posterior],
        epsilon: f64,
        rng: &mut R,
    ) -> Result<Selection> {
        if candidates.is_empty() {
            return Err(Error::InvalidArm("no candidates to select from".to_string()));
        }
        if candidates.len() != posteriors.len() {
            return Err(Error::InvalidInput(format!(
                "{} candidates but {} posteriors",
                candidates.len(),
                posteriors.len()
            )));
        }
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(Error::InvalidInput(format!(
                "epsilon must be in [0, 1], got {}",
                epsilon
            )));
        }

        let thetas: Vec<f64> = posteriors.iter().map(|p| p.sample(rng)).collect();
        let best = argmax(&thetas, posteriors);

        // The override draws among the non-argmax candidates so the
        // exploration rate is epsilon itself
        let n = candidates.len();
        let (chosen, explored) = if n > 1 && epsilon > 0.0 && rng.gen_bool(epsilon) {
            let k = rng.gen_range(0..n - 1);
            (if k >= best { k + 1 } else { k }, true)
        } else {
            (best, false)
        };

        let selection = Selection {
            arm: candidates[chosen].clone(),
            sampled_prob: thetas[chosen],
            explored,
        };
        debug!(
            arm = %selection.arm,
            theta = selection.sampled_prob,
            explored = selection.explored,
            candidates = n,
            "Arm selected"
        );
        Ok(selection)
    }
}

/// Index of the highest theta; ties go to the arm with fewer observations,
/// then to the earlier candidate
fn argmax(thetas: &[f64], posteriors: &[Posterior]) -> usize {
    let mut best = 0;
    for i in 1..thetas.len() {
        let better = thetas[i] > thetas[best]
            || (thetas[i] == thetas[best]
                && posteriors[i].observations() < posteriors[best].observations());
        if better {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    fn arms(n: usize) -> Vec<Arm> {
        (0..n)
            .map(|i| Arm::new("proposal", "energy", i as u8, "learn_more", 1))
            .collect()
    }

    #[test]
    fn test_single_candidate() {
        let candidates = arms(1);
        let mut rng = StdRng::seed_from_u64(1);
        let s = ThompsonSampler::select_from(&candidates, &[Posterior::uniform()], 0.5, &mut rng)
            .unwrap();
        assert_eq!(s.arm, candidates[0]);
        assert!(!s.explored);
    }

    #[test]
    fn test_uniform_prior_selection_is_uniform() {
        let candidates = arms(4);
        let posteriors = vec![Posterior::uniform(); 4];
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 4000;

        let mut counts: HashMap<u8, u32> = HashMap::new();
        for _ in 0..trials {
            let s = ThompsonSampler::select_from(&candidates, &posteriors, 0.0, &mut rng).unwrap();
            *counts.entry(s.arm.hour_bin).or_default() += 1;
        }

        let expected = trials as f64 / 4.0;
        let chi_square: f64 = (0..4u8)
            .map(|h| {
                let observed = *counts.get(&h).unwrap_or(&0) as f64;
                (observed - expected).powi(2) / expected
            })
            .sum();
        // df = 3, p = 0.001
        assert!(chi_square < 16.27, "chi-square {}", chi_square);
    }

    #[test]
    fn test_ties_prefer_fewer_observations() {
        let posteriors = [
            Posterior::new(4.0, 3.0),
            Posterior::new(1.5, 1.5),
            Posterior::new(2.0, 2.0),
        ];
        assert_eq!(argmax(&[0.7, 0.7, 0.7], &posteriors), 1);
        assert_eq!(argmax(&[0.9, 0.7, 0.7], &posteriors), 0);
        // Equal observations fall back to candidate order
        assert_eq!(argmax(&[0.4, 0.6, 0.6], &[Posterior::uniform(); 3]), 1);
    }

    #[tokio::test]
    async fn test_converges_to_rewarded_arm() {
        let db = Database::in_memory().await.unwrap();
        let store = BanditStore::new(&db);
        let candidates = arms(2);

        for _ in 0..25 {
            store.update(&candidates[0], 1.0).await.unwrap();
            store.update(&candidates[1], 0.0).await.unwrap();
        }

        let mut rng = StdRng::seed_from_u64(11);
        let mut wins = 0;
        let trials = 1000;
        for _ in 0..trials {
            let s = ThompsonSampler::select(&candidates, &store, 0.0, &mut rng)
                .await
                .unwrap();
            if s.arm == candidates[0] {
                wins += 1;
            }
        }
        assert!(wins as f64 / trials as f64 > 0.95, "wins {}", wins);
    }

    #[test]
    fn test_exploration_floor_with_dominant_arm() {
        let candidates = arms(5);
        let mut posteriors = vec![Posterior::new(1.0, 200.0); 5];
        posteriors[0] = Posterior::new(500.0, 1.0);

        let mut rates = Vec::new();
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ticks = 1000;
            let mut non_dominant = 0;
            for _ in 0..ticks {
                let s = ThompsonSampler::select_from(&candidates, &posteriors, 0.2, &mut rng).unwrap();
                if s.arm != candidates[0] {
                    non_dominant += 1;
                }
            }
            let rate = non_dominant as f64 / ticks as f64;
            assert!((0.15..=0.25).contains(&rate), "seed {} rate {}", seed, rate);
            rates.push(rate);
        }
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        assert!((0.18..=0.22).contains(&mean), "mean rate {}", mean);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_bad_epsilon() {
        let db = Database::in_memory().await.unwrap();
        let store = BanditStore::new(&db);
        let mut rng = StdRng::seed_from_u64(0);

        let err = ThompsonSampler::select(&[], &store, 0.1, &mut rng).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArm(_)));

        let err = ThompsonSampler::select(&arms(2), &store, 1.5, &mut rng)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_misaligned_posteriors_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = ThompsonSampler::select_from(&arms(3), &[Posterior::uniform(); 2], 0.1, &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
