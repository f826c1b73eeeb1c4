//! Offline simulation harness
//!
//! [`SimulatedPlatform`] stands in for the generator, publisher and analytics
//! collaborators. Each dimension value carries a hidden effect; an arm's true
//! reward is the mean effect of its values, and the analytics it reports are
//! noisy functions of that reward. [`run_simulation`] drives the real
//! scheduler against it on an in-memory store with a simulated clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tracing::info;

use crate::arms::{Arm, ArmDomains, Dimension};
use crate::bandit::DEFAULT_EPSILON;
use crate::config::{Config, ConfigHandle};
use crate::error::{Error, Result};
use crate::goals::GoalMode;
use crate::reward::RewardSignal;
use crate::scheduler::{
    ActionScheduler, Analytics, Collaborators, Content, ContentGenerator, CycleOutcome,
    PublishReceipt, Publisher, local_hour,
};
use crate::storage::Database;

/// Action kind the simulation drives
pub const SIMULATED_KIND: &str = "post";

#[derive(Debug)]
struct PlatformState {
    rng: StdRng,
    next_id: u64,
    published: HashMap<String, Arm>,
}

/// Scripted platform with hidden per-value effects
#[derive(Debug)]
pub struct SimulatedPlatform {
    effects: HashMap<(Dimension, String), f64>,
    noise: Normal<f64>,
    failure_rate: f64,
    state: Mutex<PlatformState>,
}

impl SimulatedPlatform {
    /// Draw hidden effects for every value in `domains`
    pub fn new(domains: &ArmDomains, seed: u64, noise: f64) -> Result<Self> {
        let noise = Normal::new(0.0, noise)
            .map_err(|e| Error::InvalidInput(format!("invalid noise level: {}", e)))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut effects = HashMap::new();
        for dimension in Dimension::ALL {
            for value in domains.values(dimension) {
                effects.insert((dimension, value), rng.gen_range(0.05..0.95));
            }
        }
        Ok(Self {
            effects,
            noise,
            failure_rate: 0.0,
            state: Mutex::new(PlatformState {
                rng,
                next_id: 0,
                published: HashMap::new(),
            }),
        })
    }

    /// Reject this share of publish attempts
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Hidden expected reward of `arm`
    pub fn true_reward(&self, arm: &Arm) -> f64 {
        let total: f64 = Dimension::ALL
            .iter()
            .map(|d| {
                self.effects
                    .get(&(*d, arm.value(*d)))
                    .copied()
                    .unwrap_or(0.0)
            })
            .sum();
        total / Dimension::ALL.len() as f64
    }

    /// Best achievable true reward once the hour is fixed
    pub fn best_reward_for_hour(&self, domains: &ArmDomains, hour: u8) -> f64 {
        let mut total = self
            .effects
            .get(&(Dimension::HourBin, hour.to_string()))
            .copied()
            .unwrap_or(0.0);
        for dimension in Dimension::ALL {
            if dimension == Dimension::HourBin {
                continue;
            }
            total += domains
                .values(dimension)
                .into_iter()
                .filter_map(|v| self.effects.get(&(dimension, v)).copied())
                .fold(0.0, f64::max);
        }
        total / Dimension::ALL.len() as f64
    }

    pub fn published_count(&self) -> u64 {
        self.lock().next_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ContentGenerator for SimulatedPlatform {
    async fn generate(&self, arm: &Arm, action_kind: &str) -> Result<Content> {
        Ok(Content::new(format!(
            "[{}] {} on {} (intensity {}, cta {})",
            action_kind, arm.post_type, arm.topic, arm.intensity, arm.cta_variant
        )))
    }
}

#[async_trait]
impl Publisher for SimulatedPlatform {
    async fn publish(&self, arm: &Arm, _content: &Content) -> Result<PublishReceipt> {
        let mut state = self.lock();
        if self.failure_rate > 0.0 && state.rng.gen_bool(self.failure_rate) {
            return Ok(PublishReceipt::rejected("simulated rate limit"));
        }
        state.next_id += 1;
        let id = format!("sim-{}", state.next_id);
        state.published.insert(id.clone(), arm.clone());
        Ok(PublishReceipt::published(id))
    }
}

#[async_trait]
impl Analytics for SimulatedPlatform {
    async fn fetch_engagement(&self, external_id: &str) -> Result<Option<RewardSignal>> {
        let mut state = self.lock();
        let Some(arm) = state.published.get(external_id).cloned() else {
            return Ok(None);
        };
        let p = self.true_reward(&arm);
        let mut noisy = |scale: f64| (p + self.noise.sample(&mut state.rng)).max(0.0) * scale;

        let likes = noisy(120.0).round() as u64;
        let reposts = noisy(20.0).round() as u64;
        let clicks = noisy(40.0).round() as u64;
        let authority = noisy(1.0).min(1.0);
        Ok(Some(
            RewardSignal::default()
                .with_engagement(likes, reposts, likes / 10, reposts / 4)
                .with_clicks(clicks)
                .with_authority(authority),
        ))
    }
}

/// Parameters of one simulation run
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub ticks: u32,
    pub seed: u64,
    pub epsilon: f64,
    pub goal_mode: GoalMode,
    pub noise: f64,
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ticks: 500,
            seed: 42,
            epsilon: DEFAULT_EPSILON,
            goal_mode: GoalMode::Impact,
            noise: 0.05,
            failure_rate: 0.0,
        }
    }
}

/// Summary of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub ticks: u32,
    pub dispatched: u64,
    pub failed: u64,
    pub resolved: u64,
    pub timed_out: u64,
    /// Mean composite reward J over resolved entries
    pub mean_reward: Option<f64>,
    /// Mean hidden reward of the dispatched arms
    pub mean_true_reward: f64,
    /// Mean gap to the best arm available at each tick
    pub mean_regret: f64,
    pub exploration_ratio: Option<f64>,
    pub best_arm: Option<Arm>,
    pub best_arm_mean: Option<f64>,
}

/// Drive select, dispatch and reconcile for `sim.ticks` simulated hours
pub async fn run_simulation(sim: &SimulationConfig) -> Result<SimulationReport> {
    let db = Database::in_memory()
        .await
        .map_err(|e| Error::Other(format!("failed to open simulation store: {:#}", e)))?;

    let mut config = Config::default();
    config.bandit.epsilon = sim.epsilon;
    config.bandit.seed = Some(sim.seed);
    config.goal.mode = sim.goal_mode;
    config.scheduler.live = true;
    config.scheduler.actions.retain(|a| a.name == SIMULATED_KIND);
    config
        .validate()
        .map_err(|e| Error::ConfigError(format!("{:#}", e)))?;

    let domains = config.arms.domains.clone();
    let grace = config.scheduler.resolve_grace();
    let offset = config.scheduler.utc_offset_hours;
    let platform = Arc::new(
        SimulatedPlatform::new(&domains, sim.seed, sim.noise)?.with_failure_rate(sim.failure_rate),
    );
    let scheduler = ActionScheduler::new(
        &db,
        Arc::new(ConfigHandle::new(config)),
        Collaborators::from_platform(Arc::clone(&platform)),
    )
    .await?;

    let start = Utc
        .with_ymd_and_hms(2025, 1, 6, 0, 0, 0)
        .single()
        .ok_or_else(|| Error::Other("invalid simulation start".to_string()))?;
    let mut true_total = 0.0;
    let mut regret_total = 0.0;
    let mut chosen = 0u32;

    for tick in 0..sim.ticks {
        let now: DateTime<Utc> = start + Duration::hours(tick as i64);
        if let CycleOutcome::Dispatched(entry) = scheduler.run_cycle_at(SIMULATED_KIND, now).await? {
            let p = platform.true_reward(&entry.arm);
            let best = platform.best_reward_for_hour(&domains, local_hour(now, offset));
            true_total += p;
            regret_total += (best - p).max(0.0);
            chosen += 1;
        }
        scheduler.reconcile_at(now + grace).await?;
    }

    let summary = scheduler.log().summary(None).await?;
    let best = scheduler.store().top_arms(1).await?.into_iter().next();
    let report = SimulationReport {
        ticks: sim.ticks,
        dispatched: summary.total - summary.failed,
        failed: summary.failed,
        resolved: summary.resolved,
        timed_out: summary.timed_out,
        mean_reward: summary.mean_reward,
        mean_true_reward: if chosen > 0 { true_total / chosen as f64 } else { 0.0 },
        mean_regret: if chosen > 0 { regret_total / chosen as f64 } else { 0.0 },
        exploration_ratio: summary.exploration_ratio(),
        best_arm_mean: best.as_ref().map(|b| b.posterior.mean()),
        best_arm: best.map(|b| b.arm),
    };
    info!(
        ticks = report.ticks,
        dispatched = report.dispatched,
        mean_true_reward = report.mean_true_reward,
        mean_regret = report.mean_regret,
        "Simulation complete"
    );
    db.close().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_true_reward_is_mean_effect() {
        let domains = ArmDomains::default();
        let platform = SimulatedPlatform::new(&domains, 7, 0.05).unwrap();
        let arm = Arm::new("proposal", "energy", 14, "join_pilot", 2);
        let p = platform.true_reward(&arm);
        assert!((0.05..0.95).contains(&p));
        assert!(platform.best_reward_for_hour(&domains, 14) >= p);
    }

    #[tokio::test]
    async fn test_publish_then_fetch() {
        let platform = SimulatedPlatform::new(&ArmDomains::default(), 7, 0.05).unwrap();
        let arm = Arm::new("thread", "policy", 9, "learn_more", 1);
        let receipt = platform.publish(&arm, &Content::new("x")).await.unwrap();
        assert!(receipt.dispatch_ok);

        let id = receipt.external_id.unwrap();
        let signal = platform.fetch_engagement(&id).await.unwrap().unwrap();
        assert!(signal.likes.is_some() && signal.clicks.is_some());
        assert!(platform.fetch_engagement("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_simulation_learns() {
        let report = run_simulation(&SimulationConfig {
            ticks: 120,
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(report.dispatched, 120);
        assert_eq!(report.resolved, 120);
        assert_eq!(report.failed, 0);
        assert!(report.best_arm.is_some());
        assert!(report.mean_regret >= 0.0);
        assert!(report.mean_true_reward > 0.0);
    }

    #[tokio::test]
    async fn test_simulation_failures_are_not_learned() {
        let report = run_simulation(&SimulationConfig {
            ticks: 60,
            failure_rate: 0.5,
            ..Default::default()
        })
        .await
        .unwrap();

        assert!(report.failed > 0);
        assert_eq!(report.dispatched + report.failed, 60);
        assert_eq!(report.resolved, report.dispatched);
    }
}
