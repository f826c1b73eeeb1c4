//! Reward model: raw outcome signals to a composite objective J in [0, 1]
//!
//! ```text
//! J = fame·norm(engagement) + revenue·norm(revenue) + authority·norm(authority)
//!     − penalty·norm(risk)
//! ```
//!
//! Each term is normalized against a trailing window. Unmeasured positive
//! terms are left out and the measured weights are rescaled to the full
//! positive mass, so a partially measured action stays on the same scale as a
//! fully measured one.

pub mod signal;
pub mod window;

pub use signal::{
    EngagementWeights, Metric, NormalizationMethod, RawMetrics, RewardConfig, RewardSignal,
    RiskWeights,
};
pub use window::{NEUTRAL, RewardWindow};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::goals::GoalWeights;

/// Scores outcome signals against the trailing window
#[derive(Debug, Clone)]
pub struct RewardModel {
    config: RewardConfig,
    window: RewardWindow,
}

impl RewardModel {
    pub fn new(config: RewardConfig) -> Result<Self> {
        config.validate()?;
        let window = RewardWindow::days(config.window_days, config.method);
        Ok(Self { config, window })
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    pub fn window(&self) -> &RewardWindow {
        &self.window
    }

    /// Swap the configuration, keeping the observed history
    pub fn reconfigure(&mut self, config: RewardConfig) -> Result<()> {
        config.validate()?;
        self.window.reconfigure(
            chrono::Duration::days(config.window_days as i64),
            config.method,
        );
        self.config = config;
        Ok(())
    }

    /// Add a signal's raw metrics to the window
    pub fn observe(&mut self, at: DateTime<Utc>, signal: &RewardSignal) {
        let raw = self.config.raw_metrics(signal);
        self.window.observe(at, raw);
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        self.window.prune(now)
    }

    /// Composite objective for `signal` under `weights`.
    ///
    /// Returns `None` when no positive term has been measured yet. Pure:
    /// identical inputs and window state give an identical result.
    pub fn score(&self, signal: &RewardSignal, weights: &GoalWeights) -> Option<f64> {
        let raw = self.config.raw_metrics(signal);
        if !raw.has_positive_term() {
            return None;
        }

        let terms = [
            (Metric::Engagement, raw.engagement, weights.fame),
            (Metric::Revenue, raw.revenue, weights.revenue),
            (Metric::Authority, raw.authority, weights.authority),
        ];
        let mut weighted = 0.0;
        let mut measured_mass = 0.0;
        for (metric, value, weight) in terms {
            if let Some(x) = value {
                weighted += weight * self.window.normalize(metric, x);
                measured_mass += weight;
            }
        }
        let positive = if measured_mass > 0.0 {
            weighted * weights.positive_mass() / measured_mass
        } else {
            0.0
        };

        let penalty = raw
            .risk
            .map(|r| weights.penalty * self.window.normalize(Metric::Risk, r))
            .unwrap_or(0.0);

        Some((positive - penalty).clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goals::{GoalMode, GoalWeightTable};

    fn model_with_history() -> RewardModel {
        let mut model = RewardModel::new(RewardConfig::default()).unwrap();
        let now = Utc::now();
        for (likes, clicks, authority) in [(0, 0, 0.0), (50, 20, 0.5), (100, 40, 1.0)] {
            let signal = RewardSignal::default()
                .with_engagement(likes, 0, 0, 0)
                .with_clicks(clicks)
                .with_authority(authority)
                .with_risk(0, 0);
            model.observe(now, &signal);
        }
        model.observe(now, &RewardSignal::default().with_engagement(0, 0, 0, 0).with_risk(0, 2));
        model
    }

    fn impact() -> GoalWeights {
        GoalWeightTable::default().get(GoalMode::Impact).unwrap()
    }

    #[test]
    fn test_score_is_pure() {
        let model = model_with_history();
        let signal = RewardSignal::default().with_engagement(60, 0, 0, 0).with_clicks(10);
        let first = model.score(&signal, &impact()).unwrap();
        for _ in 0..100 {
            assert_eq!(model.score(&signal, &impact()).unwrap(), first);
        }
    }

    #[test]
    fn test_unmeasured_signal_has_no_score() {
        let model = model_with_history();
        assert_eq!(model.score(&RewardSignal::default(), &impact()), None);
        assert_eq!(
            model.score(&RewardSignal::default().with_risk(1, 0), &impact()),
            None
        );
    }

    #[test]
    fn test_monotonic_in_each_term() {
        let model = model_with_history();
        let w = GoalWeights::new(0.3, 0.3, 0.3, 0.5);
        let base = RewardSignal::default()
            .with_engagement(40, 0, 0, 0)
            .with_clicks(10)
            .with_authority(0.4)
            .with_risk(0, 1);
        let j = model.score(&base, &w).unwrap();

        let more_likes = RewardSignal {
            likes: Some(80),
            ..base.clone()
        };
        assert!(model.score(&more_likes, &w).unwrap() >= j);

        let more_clicks = RewardSignal {
            clicks: Some(30),
            ..base.clone()
        };
        assert!(model.score(&more_clicks, &w).unwrap() >= j);

        let more_authority = RewardSignal {
            authority_score: Some(0.9),
            ..base.clone()
        };
        assert!(model.score(&more_authority, &w).unwrap() >= j);

        let more_risk = RewardSignal {
            violations: Some(2),
            ..base.clone()
        };
        assert!(model.score(&more_risk, &w).unwrap() <= j);
    }

    #[test]
    fn test_missing_terms_are_rescaled() {
        let model = model_with_history();
        let w = GoalWeights::new(0.5, 0.5, 0.0, 0.0);
        // Top-of-window engagement alone scores like a fully top-of-window action
        let engagement_only = RewardSignal::default().with_engagement(100, 0, 0, 0);
        let j = model.score(&engagement_only, &w).unwrap();
        assert!((j - 1.0).abs() < 1e-12, "j = {}", j);
    }

    #[test]
    fn test_score_clamped_to_unit_interval() {
        let model = model_with_history();
        let heavy_penalty = GoalWeights::new(0.1, 0.0, 0.0, 5.0);
        let signal = RewardSignal::default().with_engagement(0, 0, 0, 0).with_risk(0, 2);
        assert_eq!(model.score(&signal, &heavy_penalty), Some(0.0));

        let fame = GoalWeights::new(0.65, 0.15, 0.25, 0.20);
        let best = RewardSignal::default()
            .with_engagement(100, 0, 0, 0)
            .with_clicks(40)
            .with_authority(1.0);
        assert_eq!(model.score(&best, &fame), Some(1.0));
    }

    #[test]
    fn test_reconfigure_keeps_history() {
        let mut model = model_with_history();
        let before = model.window().len();
        let config = RewardConfig {
            method: NormalizationMethod::ZScore,
            ..RewardConfig::default()
        };
        model.reconfigure(config).unwrap();
        assert_eq!(model.window().len(), before);
        assert_eq!(model.window().method(), NormalizationMethod::ZScore);
    }
}
