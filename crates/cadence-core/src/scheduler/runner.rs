//! The action scheduler: decision cycles, dispatch, and reconciliation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::collaborators::{Collaborators, PublishReceipt};
use super::log::{ArmLogEntry, ArmLogStore, NewEntry, Resolution};
use super::state::{ActionState, CycleGuard, KindState, StateTracker};
use crate::arms::{Arm, ArmFilter, ArmSpace, DimensionHistory};
use crate::bandit::{BanditStore, Selection, ThompsonSampler};
use crate::config::{ActionKindConfig, Config, ConfigHandle};
use crate::error::{Error, Result};
use crate::goals::{ActiveGoal, GoalMode, GoalModeController, GoalWeights};
use crate::reward::{RewardModel, RewardSignal};
use crate::storage::Database;

/// Why a cycle did not start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Global live switch is off
    Paused,
    QuietHours,
    /// A previous cycle of the same kind is still selecting or dispatching
    InFlight,
    /// The kind is no longer configured
    Removed,
}

/// Result of one decision cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Published; the entry awaits its outcome
    Dispatched(ArmLogEntry),
    /// The publisher rejected the action; logged as FAILED
    Failed(ArmLogEntry),
}

impl CycleOutcome {
    pub fn entry(&self) -> Option<&ArmLogEntry> {
        match self {
            Self::Dispatched(entry) | Self::Failed(entry) => Some(entry),
            Self::Skipped(_) => None,
        }
    }
}

/// Tally of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending entries past the grace period
    pub examined: usize,
    pub resolved: usize,
    pub timed_out: usize,
    /// No usable outcome yet; retried next pass
    pub unavailable: usize,
    /// Already resolved elsewhere
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy)]
struct AppliedConfig {
    version: u64,
    mode: GoalMode,
}

/// Drives decision cycles per action kind and reconciles their outcomes.
///
/// Every durable effect goes through [`BanditStore`] and [`ArmLogStore`]; the
/// scheduler itself only holds caches that are rebuilt on start.
pub struct ActionScheduler {
    config: Arc<ConfigHandle>,
    store: Arc<BanditStore>,
    log: ArmLogStore,
    goals: Arc<GoalModeController>,
    collaborators: Collaborators,
    reward: Mutex<RewardModel>,
    space: RwLock<Arc<ArmSpace>>,
    rng: Mutex<StdRng>,
    tracker: StateTracker,
    halted: AtomicBool,
    halt_reason: RwLock<Option<String>>,
    applied: Mutex<AppliedConfig>,
    reconcile_lock: Mutex<()>,
}

impl ActionScheduler {
    /// Build a scheduler over `db`.
    ///
    /// The reward window is rebuilt from the raw signals of entries resolved
    /// inside it.
    pub async fn new(
        db: &Database,
        config: Arc<ConfigHandle>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let snapshot = config.snapshot();
        let space = snapshot.arm_space()?;
        let goals = GoalModeController::new(snapshot.goal.weights.clone(), snapshot.goal.mode)?;
        let log = ArmLogStore::new(db);

        let mut reward = RewardModel::new(snapshot.reward.clone())?;
        let since = Utc::now() - reward.window().span();
        let history = log.resolved_signals_since(since).await?;
        for (at, signal) in &history {
            reward.observe(*at, signal);
        }

        let rng = match snapshot.bandit.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            mode = %snapshot.goal.mode,
            epsilon = snapshot.bandit.epsilon,
            kinds = snapshot.scheduler.actions.len(),
            window_observations = history.len(),
            live = snapshot.scheduler.live,
            "Scheduler initialized"
        );

        Ok(Self {
            store: Arc::new(BanditStore::new(db)),
            log,
            goals: Arc::new(goals),
            collaborators,
            reward: Mutex::new(reward),
            space: RwLock::new(Arc::new(space)),
            rng: Mutex::new(rng),
            tracker: StateTracker::new(),
            halted: AtomicBool::new(false),
            halt_reason: RwLock::new(None),
            applied: Mutex::new(AppliedConfig {
                version: config.version(),
                mode: snapshot.goal.mode,
            }),
            reconcile_lock: Mutex::new(()),
            config,
        })
    }

    pub fn store(&self) -> &Arc<BanditStore> {
        &self.store
    }

    pub fn log(&self) -> &ArmLogStore {
        &self.log
    }

    pub fn goals(&self) -> &Arc<GoalModeController> {
        &self.goals
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    /// Switch the active goal mode; entries already dispatched keep theirs
    pub fn set_goal_mode(&self, mode: GoalMode) -> Result<ActiveGoal> {
        self.goals.set_mode(mode)
    }

    pub fn states(&self) -> Vec<KindState> {
        self.tracker.snapshot()
    }

    pub fn state(&self, kind: &str) -> ActionState {
        self.tracker.state(kind)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Run one decision cycle for `kind` as of `now`
    pub async fn run_cycle_at(&self, kind: &str, now: DateTime<Utc>) -> Result<CycleOutcome> {
        self.ensure_running()?;
        self.sync_config().await;

        let config = self.config.snapshot();
        let Some(action) = config.scheduler.action(kind) else {
            return Ok(CycleOutcome::Skipped(SkipReason::Removed));
        };
        if !config.scheduler.live {
            debug!(kind, "Paused; no new selection");
            return Ok(CycleOutcome::Skipped(SkipReason::Paused));
        }
        let hour = local_hour(now, config.scheduler.utc_offset_hours);
        if config.scheduler.quiet_hours.is_some_and(|q| q.contains(hour)) {
            debug!(kind, hour, "Quiet hours; no new selection");
            return Ok(CycleOutcome::Skipped(SkipReason::QuietHours));
        }
        let Some(mut cycle) = self.tracker.try_begin(kind) else {
            debug!(kind, "Previous cycle still in flight");
            return Ok(CycleOutcome::Skipped(SkipReason::InFlight));
        };

        let result = self
            .select_and_dispatch(&mut cycle, action, &config, hour, now)
            .await;
        if result.is_err() && !cycle.state().is_terminal() {
            // Selection errors end the cycle without a log entry
            let _ = cycle.advance(ActionState::Failed);
        }
        self.check_fatal(result)
    }

    async fn select_and_dispatch(
        &self,
        cycle: &mut CycleGuard,
        action: &ActionKindConfig,
        config: &Config,
        hour: u8,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome> {
        let kind = cycle.kind().to_string();
        let goal = self.goals.current();
        let space = self.arm_space();
        let history = DimensionHistory::from_posteriors(&self.store.observed().await?);
        let candidates = enumerate_for_hour(&space, goal.mode, &action.pins, hour, &history)?;

        let posteriors = self.store.get_or_init_many(&candidates).await?;
        // The RNG is shared across kinds; hold it only for the draw
        let selection = {
            let mut rng = self.rng.lock().await;
            ThompsonSampler::select_from(&candidates, &posteriors, config.bandit.epsilon, &mut *rng)?
        };

        cycle.advance(ActionState::Dispatched)?;
        let receipt = self.dispatch(&selection.arm, &kind).await;
        let error = match (receipt.dispatch_ok, &receipt.error) {
            (true, _) => None,
            (false, Some(e)) => Some(e.clone()),
            (false, None) => Some("publisher reported failure".to_string()),
        };

        let entry = self
            .log
            .append(&NewEntry {
                action_kind: &kind,
                selection: &selection,
                goal,
                external_id: receipt.external_id.clone(),
                error,
                created_at: now,
            })
            .await?;

        if entry.error.is_some() {
            cycle.advance(ActionState::Failed)?;
            error!(
                kind = %kind,
                arm = %selection.arm,
                entry_id = %entry.entry_id,
                error = entry.error.as_deref().unwrap_or_default(),
                "Dispatch failed; excluded from learning"
            );
            return Ok(CycleOutcome::Failed(entry));
        }

        cycle.advance(ActionState::AwaitingOutcome)?;
        if entry.external_id.is_none() {
            warn!(entry_id = %entry.entry_id, "Publisher returned no external id; entry will time out");
        }
        log_dispatch(&kind, &selection, &entry);
        Ok(CycleOutcome::Dispatched(entry))
    }

    /// Generate and publish; collaborator errors become a rejected receipt
    async fn dispatch(&self, arm: &Arm, kind: &str) -> PublishReceipt {
        let content = match self.collaborators.generator.generate(arm, kind).await {
            Ok(content) => content,
            Err(e) => return PublishReceipt::rejected(format!("generation failed: {}", e)),
        };
        match self.collaborators.publisher.publish(arm, &content).await {
            Ok(receipt) => receipt,
            Err(e) => PublishReceipt::rejected(e.to_string()),
        }
    }

    /// One reconciliation pass as of `now`
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        self.ensure_running()?;
        let _pass = self.reconcile_lock.lock().await;
        self.sync_config().await;
        let result = self.reconcile_pending(now).await;
        self.check_fatal(result)
    }

    async fn reconcile_pending(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let config = self.config.snapshot();
        let grace = config.scheduler.resolve_grace();
        let timeout = config.scheduler.timeout();
        self.reward.lock().await.prune(now);

        let pending = self.log.pending_older_than(now - grace).await?;
        let mut report = ReconcileReport {
            examined: pending.len(),
            ..Default::default()
        };

        for entry in &pending {
            let resolution = self.fetch_resolution(entry, now).await;
            let resolution = match resolution {
                Some(resolution) => resolution,
                None if now - entry.created_at >= timeout => Resolution::TimedOut,
                None => {
                    report.unavailable += 1;
                    continue;
                }
            };

            match self.log.resolve(&self.store, entry, &resolution, now).await? {
                None => report.skipped += 1,
                Some(posterior) => match resolution {
                    Resolution::TimedOut => {
                        report.timed_out += 1;
                        warn!(
                            entry_id = %entry.entry_id,
                            arm = %entry.arm,
                            degraded = true,
                            error = %Error::TimeoutResolution(entry.entry_id.clone()),
                            "Entry timed out"
                        );
                    }
                    Resolution::Resolved { reward, ref signal } => {
                        self.reward.lock().await.observe(now, signal);
                        report.resolved += 1;
                        info!(
                            entry_id = %entry.entry_id,
                            arm = %entry.arm,
                            reward,
                            alpha = posterior.alpha,
                            beta = posterior.beta,
                            "Entry resolved"
                        );
                    }
                },
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                resolved = report.resolved,
                timed_out = report.timed_out,
                unavailable = report.unavailable,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Fetch and score the outcome of one entry; `None` when not yet usable
    async fn fetch_resolution(&self, entry: &ArmLogEntry, now: DateTime<Utc>) -> Option<Resolution> {
        let external_id = entry.external_id.as_deref()?;
        let signal = match self.collaborators.analytics.fetch_engagement(external_id).await {
            Ok(Some(signal)) => signal,
            Ok(None) => {
                debug!(entry_id = %entry.entry_id, external_id, "No outcome yet");
                return None;
            }
            Err(e) => {
                warn!(
                    entry_id = %entry.entry_id,
                    error = %e,
                    code = Error::OutcomeUnavailable(external_id.to_string()).code(),
                    "Analytics fetch failed; will retry"
                );
                return None;
            }
        };

        let model = self.reward.lock().await;
        if !model.config().raw_metrics(&signal).has_positive_term() {
            debug!(entry_id = %entry.entry_id, "Outcome carries no measured objective yet");
            return None;
        }
        // The signal joins the shared window only once its entry is resolved
        let mut trial = model.clone();
        trial.observe(now, &signal);
        // Scored under the weights captured at selection time
        let reward = trial.score(&signal, &entry.weights)?;
        Some(Resolution::Resolved { reward, signal })
    }

    /// Score `signal` against the current reward window without recording it
    pub async fn score_signal(&self, signal: &RewardSignal, weights: &GoalWeights) -> Option<f64> {
        self.reward.lock().await.score(signal, weights)
    }

    /// Observations currently held in the reward window
    pub async fn reward_window_len(&self) -> usize {
        self.reward.lock().await.window().len()
    }

    /// Run every loop until `shutdown` fires or the store fails
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let kinds: Vec<String> = self
            .config
            .snapshot()
            .scheduler
            .actions
            .iter()
            .map(|a| a.name.clone())
            .collect();

        let mut tasks = JoinSet::new();
        for kind in kinds {
            tasks.spawn(Arc::clone(&self).kind_loop(kind, shutdown.clone()));
        }
        tasks.spawn(Arc::clone(&self).reconcile_loop(shutdown.clone()));
        tasks.spawn(Arc::clone(&self).config_loop(shutdown.clone()));

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(Error::Other(format!("scheduler task failed: {}", e))));
            if let Err(e) = result {
                shutdown.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        info!("Scheduler stopped");
        outcome
    }

    async fn kind_loop(self: Arc<Self>, kind: String, shutdown: CancellationToken) -> Result<()> {
        loop {
            let Some(delay) = self.next_cycle_delay(&kind) else {
                info!(kind = %kind, "Action kind removed; loop exiting");
                return Ok(());
            };
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.run_cycle_at(&kind, Utc::now()).await {
                Ok(CycleOutcome::Skipped(SkipReason::Removed)) => {
                    info!(kind = %kind, "Action kind removed; loop exiting");
                    return Ok(());
                }
                Ok(outcome) => debug!(kind = %kind, ?outcome, "Cycle finished"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(kind = %kind, error = %e, code = e.code(), "Cycle failed"),
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let delay = {
                let config = self.config.snapshot();
                let s = &config.scheduler;
                draw_delay(s.reconcile_min_minutes, s.reconcile_max_minutes, 0)
            };
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.reconcile_at(Utc::now()).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, code = e.code(), "Reconciliation pass failed"),
            }
        }
    }

    async fn config_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            let poll = StdDuration::from_secs(self.config.snapshot().scheduler.config_poll_secs.max(1));
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }

            match self.config.reload_if_changed() {
                Ok(true) => self.sync_config().await,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Config reload rejected; keeping current configuration"),
            }
        }
    }

    fn next_cycle_delay(&self, kind: &str) -> Option<StdDuration> {
        let config = self.config.snapshot();
        let action = config.scheduler.action(kind)?;
        Some(draw_delay(
            action.min_interval_minutes,
            action.max_interval_minutes,
            action.jitter_secs,
        ))
    }

    /// Apply a configuration swap to the derived state, once per version
    async fn sync_config(&self) {
        let version = self.config.version();
        let mut applied = self.applied.lock().await;
        if applied.version == version {
            return;
        }
        let config = self.config.snapshot();

        if let Err(e) = self.apply_config(&config, applied.mode).await {
            warn!(version, error = %e, "Configuration not applied");
            return;
        }
        *applied = AppliedConfig {
            version,
            mode: config.goal.mode,
        };
        info!(version, mode = %self.goals.current_mode(), "Configuration applied");
    }

    async fn apply_config(&self, config: &Config, previous_mode: GoalMode) -> Result<()> {
        let space = config.arm_space()?;
        self.reward.lock().await.reconfigure(config.reward.clone())?;
        self.goals.replace_table(config.goal.weights.clone())?;
        // A mode set at runtime survives unrelated reloads
        if config.goal.mode != previous_mode {
            self.goals.set_mode(config.goal.mode)?;
        }
        *self.space.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(space);
        Ok(())
    }

    fn arm_space(&self) -> Arc<ArmSpace> {
        Arc::clone(&self.space.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            let reason = self.halt_reason().unwrap_or_else(|| "store unavailable".to_string());
            return Err(Error::SchedulerHalted(reason));
        }
        Ok(())
    }

    fn check_fatal<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_fatal() && !matches!(e, Error::SchedulerHalted(_)) => self.halt(e),
            _ => {}
        }
        result
    }

    fn halt(&self, cause: &Error) {
        *self.halt_reason.write().unwrap_or_else(|p| p.into_inner()) = Some(cause.to_string());
        self.halted.store(true, Ordering::Release);
        error!(health = "critical", error = %cause, code = cause.code(), "Scheduling halted");
    }
}

/// Candidates pinned to the current posting hour, falling back to the full
/// hour domain when that hour is not a legal value
fn enumerate_for_hour(
    space: &ArmSpace,
    mode: GoalMode,
    pins: &ArmFilter,
    hour: u8,
    history: &DimensionHistory,
) -> Result<Vec<Arm>> {
    if pins.hour_bins.is_some() {
        return space.enumerate_candidates(mode, pins, history);
    }
    let pinned = pins.clone().with_hour_bins(vec![hour]);
    match space.enumerate_candidates(mode, &pinned, history) {
        Err(Error::InvalidArm(reason)) => {
            debug!(hour, reason = %reason, "Posting hour not selectable; re-enumerating");
            space.enumerate_candidates(mode, pins, history)
        }
        other => other,
    }
}

fn log_dispatch(kind: &str, selection: &Selection, entry: &ArmLogEntry) {
    info!(
        kind,
        arm = %selection.arm,
        fingerprint = %selection.arm.fingerprint(),
        theta = selection.sampled_prob,
        explored = selection.explored,
        goal_mode = %entry.goal_mode,
        entry_id = %entry.entry_id,
        "Dispatched action"
    );
}

/// Hour of day after applying the configured UTC offset
pub fn local_hour(now: DateTime<Utc>, utc_offset_hours: i32) -> u8 {
    (now + Duration::hours(utc_offset_hours as i64)).hour() as u8
}

fn draw_delay(min_minutes: u64, max_minutes: u64, jitter_secs: u64) -> StdDuration {
    let mut rng = rand::thread_rng();
    let (lo, hi) = (min_minutes.min(max_minutes), min_minutes.max(max_minutes));
    let base = rng.gen_range(lo * 60..=hi * 60);
    let jitter = if jitter_secs > 0 {
        rng.gen_range(0..=jitter_secs)
    } else {
        0
    };
    // Never a tight loop, even with a zero interval configured
    StdDuration::from_secs((base + jitter).max(1))
}
