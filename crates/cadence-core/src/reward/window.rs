//! Trailing normalization window
//!
//! Raw metric scales drift (follower growth, seasonal traffic), so each raw
//! value is normalized against the values observed in the trailing window.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::signal::{Metric, NormalizationMethod, RawMetrics};

/// Neutral normalized value when the window cannot discriminate
pub const NEUTRAL: f64 = 0.5;

/// Timestamped raw metrics inside the trailing window
#[derive(Debug, Clone)]
pub struct RewardWindow {
    span: Duration,
    method: NormalizationMethod,
    observations: VecDeque<(DateTime<Utc>, RawMetrics)>,
}

impl RewardWindow {
    pub fn new(span: Duration, method: NormalizationMethod) -> Self {
        Self {
            span,
            method,
            observations: VecDeque::new(),
        }
    }

    pub fn days(days: u32, method: NormalizationMethod) -> Self {
        Self::new(Duration::days(days as i64), method)
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    pub fn method(&self) -> NormalizationMethod {
        self.method
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observe(&mut self, at: DateTime<Utc>, raw: RawMetrics) {
        self.observations.push_back((at, raw));
    }

    /// Drop observations older than `now - span`
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.span;
        let before = self.observations.len();
        self.observations.retain(|(at, _)| *at >= cutoff);
        before - self.observations.len()
    }

    /// Re-configure the window in place (hot reload)
    pub fn reconfigure(&mut self, span: Duration, method: NormalizationMethod) {
        self.span = span;
        self.method = method;
    }

    /// Map a raw value into [0, 1] relative to the window.
    ///
    /// Degenerate windows give [`NEUTRAL`]. A non-positive risk always maps to
    /// zero so an action without infractions is never penalized.
    pub fn normalize(&self, metric: Metric, x: f64) -> f64 {
        if metric == Metric::Risk && x <= 0.0 {
            return 0.0;
        }
        let values: Vec<f64> = self
            .observations
            .iter()
            .filter_map(|(_, raw)| raw.get(metric))
            .filter(|v| v.is_finite())
            .collect();

        match self.method {
            NormalizationMethod::MinMax => min_max(&values, x),
            NormalizationMethod::ZScore => z_score(&values, x),
        }
    }
}

fn min_max(values: &[f64], x: f64) -> f64 {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() || max - min <= f64::EPSILON {
        return NEUTRAL;
    }
    ((x - min) / (max - min)).clamp(0.0, 1.0)
}

fn z_score(values: &[f64], x: f64) -> f64 {
    if values.len() < 2 {
        return NEUTRAL;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std <= f64::EPSILON {
        return NEUTRAL;
    }
    1.0 / (1.0 + (-(x - mean) / std).exp())
}
