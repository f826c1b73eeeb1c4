//! Beta posterior over an arm's expected reward

use rand::Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

/// Beta(alpha, beta) belief about an arm's expected reward.
///
/// Both parameters start at 1 (uniform prior) and only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for Posterior {
    fn default() -> Self {
        Self::uniform()
    }
}

impl Posterior {
    pub const fn uniform() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }

    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    /// Total fractional observations folded in so far
    pub fn observations(&self) -> f64 {
        self.alpha + self.beta - 2.0
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Continuous Beta-Bernoulli update with a reward in [0, 1]
    pub fn updated(&self, reward: f64) -> Self {
        let reward = if reward.is_finite() {
            reward.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            alpha: self.alpha + reward,
            beta: self.beta + (1.0 - reward),
        }
    }

    /// Draw theta ~ Beta(alpha, beta)
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng),
            // Only reachable with corrupted parameters
            Err(_) => 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_uniform_prior() {
        let p = Posterior::default();
        assert_eq!(p, Posterior::new(1.0, 1.0));
        assert_eq!(p.observations(), 0.0);
        assert_eq!(p.mean(), 0.5);
    }

    #[test]
    fn test_fractional_update() {
        let p = Posterior::uniform().updated(0.8);
        assert!((p.alpha - 1.8).abs() < 1e-12);
        assert!((p.beta - 1.2).abs() < 1e-12);
        assert!((p.observations() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_update_clamps_out_of_range_rewards() {
        let p = Posterior::uniform().updated(3.0);
        assert_eq!(p, Posterior::new(2.0, 1.0));

        let p = Posterior::uniform().updated(f64::NAN);
        assert_eq!(p, Posterior::new(1.0, 2.0));
    }

    #[test]
    fn test_parameters_never_decrease() {
        let mut p = Posterior::uniform();
        for reward in [0.0, 1.0, 0.3, 0.9, 0.0] {
            let next = p.updated(reward);
            assert!(next.alpha >= p.alpha && next.beta >= p.beta);
            p = next;
        }
    }

    #[test]
    fn test_seeded_sample_mean() {
        let p = Posterior::new(1.8, 1.2);
        let mut rng = StdRng::seed_from_u64(7);
        let n = 10_000;
        let mean = (0..n).map(|_| p.sample(&mut rng)).sum::<f64>() / n as f64;
        assert!((mean - 0.6).abs() < 0.02, "sample mean {}", mean);
    }

    #[test]
    fn test_samples_in_unit_interval() {
        let p = Posterior::new(40.0, 2.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let theta = p.sample(&mut rng);
            assert!((0.0..=1.0).contains(&theta));
        }
    }
}
