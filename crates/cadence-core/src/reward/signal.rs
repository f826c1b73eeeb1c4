//! Raw outcome signals and their reduction to scalar metrics

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Raw outcome counts for one dispatched action.
///
/// Every field is optional: `None` means "not yet measured", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSignal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reposts: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quotes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clicks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_strikes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violations: Option<u32>,
}

impl RewardSignal {
    pub fn with_engagement(mut self, likes: u64, reposts: u64, replies: u64, quotes: u64) -> Self {
        self.likes = Some(likes);
        self.reposts = Some(reposts);
        self.replies = Some(replies);
        self.quotes = Some(quotes);
        self
    }

    pub fn with_clicks(mut self, clicks: u64) -> Self {
        self.clicks = Some(clicks);
        self
    }

    pub fn with_revenue(mut self, usd: f64) -> Self {
        self.revenue_usd = Some(usd);
        self
    }

    pub fn with_authority(mut self, score: f64) -> Self {
        self.authority_score = Some(score);
        self
    }

    pub fn with_risk(mut self, strikes: u32, violations: u32) -> Self {
        self.rate_limit_strikes = Some(strikes);
        self.violations = Some(violations);
        self
    }
}

/// Scalar metric a signal reduces to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Engagement,
    Revenue,
    Authority,
    Risk,
}

/// Per-metric raw values; `None` when the signal did not measure it
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetrics {
    pub engagement: Option<f64>,
    pub revenue: Option<f64>,
    pub authority: Option<f64>,
    pub risk: Option<f64>,
}

impl RawMetrics {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Engagement => self.engagement,
            Metric::Revenue => self.revenue,
            Metric::Authority => self.authority,
            Metric::Risk => self.risk,
        }
    }

    /// Whether any objective term (not the penalty) was measured
    pub fn has_positive_term(&self) -> bool {
        self.engagement.is_some() || self.revenue.is_some() || self.authority.is_some()
    }
}

/// Trailing-window normalization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    #[default]
    MinMax,
    ZScore,
}

impl fmt::Display for NormalizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinMax => f.write_str("min_max"),
            Self::ZScore => f.write_str("z_score"),
        }
    }
}

impl FromStr for NormalizationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "min_max" | "minmax" => Ok(Self::MinMax),
            "z_score" | "zscore" => Ok(Self::ZScore),
            _ => Err(Error::InvalidInput(format!(
                "unknown normalization method '{}' (expected min_max or z_score)",
                s
            ))),
        }
    }
}

/// Weights of the engagement proxy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngagementWeights {
    pub likes: f64,
    pub reposts: f64,
    pub replies: f64,
    pub quotes: f64,
}

impl Default for EngagementWeights {
    fn default() -> Self {
        Self {
            likes: 1.0,
            reposts: 2.0,
            replies: 1.5,
            quotes: 1.5,
        }
    }
}

/// Weights of the raw risk score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub rate_limit_strike: f64,
    pub violation: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            rate_limit_strike: 2.0,
            violation: 5.0,
        }
    }
}

/// Reward model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Trailing normalization window in days
    pub window_days: u32,
    pub method: NormalizationMethod,
    /// Used when a signal carries clicks but no revenue amount
    pub revenue_per_click: f64,
    pub engagement: EngagementWeights,
    pub risk: RiskWeights,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            method: NormalizationMethod::MinMax,
            revenue_per_click: 0.05,
            engagement: EngagementWeights::default(),
            risk: RiskWeights::default(),
        }
    }
}

impl RewardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_days == 0 {
            return Err(Error::ConfigError("reward.window_days must be at least 1".to_string()));
        }
        let e = &self.engagement;
        let weights = [
            e.likes,
            e.reposts,
            e.replies,
            e.quotes,
            self.revenue_per_click,
            self.risk.rate_limit_strike,
            self.risk.violation,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::ConfigError(
                "reward weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Reduce a signal to raw per-metric values
    pub fn raw_metrics(&self, signal: &RewardSignal) -> RawMetrics {
        let w = &self.engagement;
        let counts = [
            (signal.likes, w.likes),
            (signal.reposts, w.reposts),
            (signal.replies, w.replies),
            (signal.quotes, w.quotes),
        ];
        let engagement = counts
            .iter()
            .any(|(c, _)| c.is_some())
            .then(|| counts.iter().map(|(c, w)| c.unwrap_or(0) as f64 * w).sum());

        let revenue = signal
            .revenue_usd
            .or_else(|| signal.clicks.map(|c| c as f64 * self.revenue_per_click));

        let risk = (signal.rate_limit_strikes.is_some() || signal.violations.is_some()).then(|| {
            signal.rate_limit_strikes.unwrap_or(0) as f64 * self.risk.rate_limit_strike
                + signal.violations.unwrap_or(0) as f64 * self.risk.violation
        });

        RawMetrics {
            engagement,
            revenue,
            authority: signal.authority_score,
            risk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_is_not_zero() {
        let config = RewardConfig::default();
        let raw = config.raw_metrics(&RewardSignal::default());
        assert_eq!(raw, RawMetrics::default());
        assert!(!raw.has_positive_term());

        let raw = config.raw_metrics(&RewardSignal::default().with_engagement(0, 0, 0, 0));
        assert_eq!(raw.engagement, Some(0.0));
        assert!(raw.has_positive_term());
    }

    #[test]
    fn test_engagement_proxy() {
        let config = RewardConfig::default();
        let raw = config.raw_metrics(&RewardSignal::default().with_engagement(10, 3, 2, 2));
        assert_eq!(raw.engagement, Some(10.0 + 6.0 + 3.0 + 3.0));

        let partial = RewardSignal {
            likes: Some(4),
            ..Default::default()
        };
        assert_eq!(config.raw_metrics(&partial).engagement, Some(4.0));
    }

    #[test]
    fn test_revenue_prefers_amount_over_clicks() {
        let config = RewardConfig::default();
        let raw = config.raw_metrics(&RewardSignal::default().with_clicks(40));
        assert!((raw.revenue.unwrap() - 2.0).abs() < 1e-12);

        let raw = config.raw_metrics(&RewardSignal::default().with_clicks(40).with_revenue(9.5));
        assert_eq!(raw.revenue, Some(9.5));
    }

    #[test]
    fn test_risk_score() {
        let config = RewardConfig::default();
        let raw = config.raw_metrics(&RewardSignal::default().with_risk(1, 2));
        assert_eq!(raw.risk, Some(12.0));
        assert!(!raw.has_positive_term());
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("z-score".parse::<NormalizationMethod>().unwrap(), NormalizationMethod::ZScore);
        assert_eq!("MIN_MAX".parse::<NormalizationMethod>().unwrap(), NormalizationMethod::MinMax);
        assert!("rank".parse::<NormalizationMethod>().is_err());
    }

    #[test]
    fn test_signal_json_omits_unmeasured() {
        let json = serde_json::to_string(&RewardSignal::default().with_clicks(3)).unwrap();
        assert_eq!(json, r#"{"clicks":3}"#);
        let back: RewardSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.likes, None);
    }
}
