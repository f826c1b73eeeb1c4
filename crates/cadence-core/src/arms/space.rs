//! Candidate enumeration over the arm space
//!
//! The full cross product of all dimension domains is large, so each decision
//! cycle works on a pruned candidate set: per dimension, the historically
//! best `top_k` values by pooled posterior mean plus at least one value that
//! has never been tried.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::types::{Arm, ArmDomains, ArmFilter, Dimension};
use crate::bandit::ArmPosterior;
use crate::error::{Error, Result};
use crate::goals::GoalMode;

/// Default number of historically best values kept per dimension
pub const DEFAULT_TOP_K: usize = 3;

/// Pooled evidence for one dimension value across every arm that carries it
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ValueStats {
    /// Sum of fractional successes (alpha - 1)
    pub successes: f64,
    /// Sum of observations (alpha + beta - 2)
    pub observations: f64,
    /// Arms contributing to this value
    pub arms: u32,
}

impl ValueStats {
    pub fn mean(&self) -> Option<f64> {
        (self.observations > 0.0).then(|| self.successes / self.observations)
    }

    pub fn is_tried(&self) -> bool {
        self.observations > 0.0
    }
}

/// Best-known value for one dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub dimension: Dimension,
    pub value: String,
    pub mean: f64,
    pub observations: f64,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:<18} mean={:.3} n={:.1}",
            self.dimension.as_str(),
            self.value,
            self.mean,
            self.observations
        )
    }
}

/// Per-dimension reward history derived from stored posteriors
#[derive(Debug, Clone, Default)]
pub struct DimensionHistory {
    stats: HashMap<(Dimension, String), ValueStats>,
}

impl DimensionHistory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_posteriors(posteriors: &[ArmPosterior]) -> Self {
        let mut stats: HashMap<(Dimension, String), ValueStats> = HashMap::new();
        for entry in posteriors {
            let p = entry.posterior;
            for dimension in Dimension::ALL {
                let s = stats.entry((dimension, entry.arm.value(dimension))).or_default();
                s.successes += p.alpha - 1.0;
                s.observations += p.observations();
                s.arms += 1;
            }
        }
        Self { stats }
    }

    pub fn get(&self, dimension: Dimension, value: &str) -> ValueStats {
        self.stats
            .get(&(dimension, value.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Best value per dimension.
    ///
    /// Among values with at least `min_samples` observations the highest mean
    /// wins; a dimension with no such value falls back to its most observed
    /// value. Dimensions without any history are omitted.
    pub fn recommendations(&self, min_samples: f64) -> Vec<Recommendation> {
        let mut out = Vec::new();
        for dimension in Dimension::ALL {
            let mut values: Vec<(&String, &ValueStats)> = self
                .stats
                .iter()
                .filter(|((d, _), s)| *d == dimension && s.is_tried())
                .map(|((_, v), s)| (v, s))
                .collect();
            if values.is_empty() {
                continue;
            }
            values.sort_by(|a, b| a.0.cmp(b.0));

            let confident = values
                .iter()
                .filter(|(_, s)| s.observations >= min_samples)
                .max_by(|a, b| a.1.mean().unwrap_or(0.0).total_cmp(&b.1.mean().unwrap_or(0.0)));
            let best = confident.or_else(|| {
                values
                    .iter()
                    .max_by(|a, b| a.1.observations.total_cmp(&b.1.observations))
            });

            if let Some((value, stats)) = best {
                out.push(Recommendation {
                    dimension,
                    value: (*value).clone(),
                    mean: stats.mean().unwrap_or(0.0),
                    observations: stats.observations,
                });
            }
        }
        out
    }
}

/// Legal decision space plus the pruning policy
#[derive(Debug, Clone)]
pub struct ArmSpace {
    domains: ArmDomains,
    top_k: usize,
    goal_restrictions: HashMap<GoalMode, ArmFilter>,
}

impl ArmSpace {
    pub fn new(domains: ArmDomains, top_k: usize) -> Result<Self> {
        domains.validate()?;
        if top_k == 0 {
            return Err(Error::ConfigError("arms.top_k must be at least 1".to_string()));
        }
        Ok(Self {
            domains,
            top_k,
            goal_restrictions: HashMap::new(),
        })
    }

    /// Restrict the space whenever `mode` is active
    pub fn with_goal_restriction(mut self, mode: GoalMode, filter: ArmFilter) -> Result<Self> {
        self.domains.restrict(&filter)?;
        self.goal_restrictions.insert(mode, filter);
        Ok(self)
    }

    pub fn domains(&self) -> &ArmDomains {
        &self.domains
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Working candidate set for one decision cycle.
    ///
    /// The goal-mode restriction and `pins` narrow the domains first (a value
    /// outside its domain is `InvalidArm`), then every dimension is pruned
    /// and the cross product of the survivors is returned in domain order.
    pub fn enumerate_candidates(
        &self,
        goal_mode: GoalMode,
        pins: &ArmFilter,
        history: &DimensionHistory,
    ) -> Result<Vec<Arm>> {
        let mut domains = self.domains.clone();
        if let Some(restriction) = self.goal_restrictions.get(&goal_mode) {
            domains = domains.restrict(restriction)?;
        }
        domains = domains.restrict(pins)?;

        let pruned = ArmDomains {
            post_types: prune(Dimension::PostType, &domains.post_types, history, self.top_k),
            topics: prune(Dimension::Topic, &domains.topics, history, self.top_k),
            hour_bins: prune(Dimension::HourBin, &domains.hour_bins, history, self.top_k),
            cta_variants: prune(Dimension::CtaVariant, &domains.cta_variants, history, self.top_k),
            intensities: prune(Dimension::Intensity, &domains.intensities, history, self.top_k),
        };

        let mut candidates = Vec::with_capacity(pruned.cardinality());
        for post_type in &pruned.post_types {
            for topic in &pruned.topics {
                for hour_bin in &pruned.hour_bins {
                    for cta_variant in &pruned.cta_variants {
                        for intensity in &pruned.intensities {
                            candidates.push(Arm::new(
                                post_type.clone(),
                                topic.clone(),
                                *hour_bin,
                                cta_variant.clone(),
                                *intensity,
                            ));
                        }
                    }
                }
            }
        }

        debug!(
            goal_mode = %goal_mode,
            full = domains.cardinality(),
            candidates = candidates.len(),
            "Enumerated candidates"
        );
        Ok(candidates)
    }
}

/// Keep the top-k tried values by mean (earlier domain position breaks ties),
/// fill up to k with untried values in domain order, and always keep at least
/// one untried value when one exists. Output keeps domain order.
fn prune<T>(dimension: Dimension, values: &[T], history: &DimensionHistory, top_k: usize) -> Vec<T>
where
    T: Clone + ToString,
{
    let mut tried: Vec<(usize, f64)> = Vec::new();
    let mut untried: Vec<usize> = Vec::new();
    for (i, value) in values.iter().enumerate() {
        match history.get(dimension, &value.to_string()).mean() {
            Some(mean) => tried.push((i, mean)),
            None => untried.push(i),
        }
    }
    tried.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut keep: HashSet<usize> = tried.iter().take(top_k).map(|(i, _)| *i).collect();
    let fill = top_k.saturating_sub(keep.len()).max(1);
    keep.extend(untried.iter().take(fill));

    values
        .iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, v)| v.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::Posterior;

    fn small_domains() -> ArmDomains {
        ArmDomains {
            post_types: vec!["proposal".into(), "thread".into()],
            topics: vec!["energy".into(), "policy".into(), "technology".into(), "economics".into()],
            hour_bins: vec![9, 14],
            cta_variants: vec!["learn_more".into(), "join_pilot".into()],
            intensities: vec![1, 2],
        }
    }

    fn seen(arm: Arm, alpha: f64, beta: f64) -> ArmPosterior {
        ArmPosterior {
            arm,
            posterior: Posterior::new(alpha, beta),
        }
    }

    #[test]
    fn test_no_history_keeps_first_k_values() {
        let space = ArmSpace::new(small_domains(), 3).unwrap();
        let candidates = space
            .enumerate_candidates(GoalMode::Impact, &ArmFilter::default(), &DimensionHistory::empty())
            .unwrap();
        // topics pruned to 3 of 4, everything else fits in k
        assert_eq!(candidates.len(), 2 * 3 * 2 * 2 * 2);
        assert!(candidates.iter().all(|a| a.topic != "economics"));
    }

    #[test]
    fn test_history_prefers_best_values_and_keeps_one_untried() {
        let space = ArmSpace::new(small_domains(), 2).unwrap();
        let history = DimensionHistory::from_posteriors(&[
            seen(Arm::new("proposal", "energy", 9, "learn_more", 1), 9.0, 2.0),
            seen(Arm::new("proposal", "policy", 9, "learn_more", 1), 2.0, 9.0),
            seen(Arm::new("proposal", "technology", 9, "learn_more", 1), 6.0, 4.0),
        ]);

        let candidates = space
            .enumerate_candidates(GoalMode::Impact, &ArmFilter::default(), &history)
            .unwrap();
        let topics: HashSet<&str> = candidates.iter().map(|a| a.topic.as_str()).collect();
        assert_eq!(topics, HashSet::from(["energy", "technology", "economics"]));
    }

    #[test]
    fn test_pruning_is_deterministic() {
        let space = ArmSpace::new(ArmDomains::default(), 3).unwrap();
        let history = DimensionHistory::from_posteriors(&[seen(
            Arm::new("insight", "energy", 14, "book_call", 2),
            3.0,
            1.5,
        )]);
        let a = space
            .enumerate_candidates(GoalMode::Fame, &ArmFilter::default(), &history)
            .unwrap();
        let b = space
            .enumerate_candidates(GoalMode::Fame, &ArmFilter::default(), &history)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pins_and_goal_restriction_apply() {
        let space = ArmSpace::new(small_domains(), 3)
            .unwrap()
            .with_goal_restriction(
                GoalMode::Monetize,
                ArmFilter::default().with_cta_variants(&["join_pilot"]),
            )
            .unwrap();
        let pins = ArmFilter::default().with_post_type("thread").with_hour_bins(vec![14]);

        let candidates = space
            .enumerate_candidates(GoalMode::Monetize, &pins, &DimensionHistory::empty())
            .unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|a| a.post_type == "thread"
            && a.hour_bin == 14
            && a.cta_variant == "join_pilot"));

        // The restriction only applies to its own mode
        let impact = space
            .enumerate_candidates(GoalMode::Impact, &pins, &DimensionHistory::empty())
            .unwrap();
        assert!(impact.iter().any(|a| a.cta_variant == "learn_more"));
    }

    #[test]
    fn test_out_of_domain_pin_is_invalid_arm() {
        let space = ArmSpace::new(small_domains(), 3).unwrap();
        let pins = ArmFilter::default().with_topics(&["cooking"]);
        let err = space
            .enumerate_candidates(GoalMode::Impact, &pins, &DimensionHistory::empty())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArm(_)));

        let bad_restriction = ArmSpace::new(small_domains(), 3)
            .unwrap()
            .with_goal_restriction(GoalMode::Fame, ArmFilter::default().with_hour_bins(vec![3]));
        assert!(matches!(bad_restriction, Err(Error::InvalidArm(_))));
    }

    #[test]
    fn test_recommendations() {
        let history = DimensionHistory::from_posteriors(&[
            seen(Arm::new("proposal", "energy", 9, "learn_more", 1), 4.0, 1.0),
            seen(Arm::new("thread", "energy", 9, "learn_more", 1), 1.5, 2.5),
            seen(Arm::new("thread", "policy", 14, "learn_more", 1), 1.2, 1.8),
        ]);
        let recs = history.recommendations(3.0);

        let post_type = recs.iter().find(|r| r.dimension == Dimension::PostType).unwrap();
        assert_eq!(post_type.value, "proposal");
        assert!((post_type.mean - 1.0).abs() < 1e-9);

        // No topic value besides energy reaches three observations
        let topic = recs.iter().find(|r| r.dimension == Dimension::Topic).unwrap();
        assert_eq!(topic.value, "energy");
    }

    #[test]
    fn test_zero_top_k_rejected() {
        assert!(ArmSpace::new(small_domains(), 0).is_err());
    }
}
