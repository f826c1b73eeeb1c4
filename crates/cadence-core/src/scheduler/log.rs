//! Append-only decision log (`arm_log`)
//!
//! Every dispatch attempt writes exactly one row. A row is mutated once, when
//! it leaves `DISPATCHED`, and that transition is committed in the same
//! transaction as the posterior update it causes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::arms::Arm;
use crate::bandit::store::apply_reward;
use crate::bandit::{BanditStore, Posterior, Selection};
use crate::error::{Error, Result};
use crate::goals::{ActiveGoal, GoalMode, GoalWeights};
use crate::reward::RewardSignal;
use crate::storage::{Database, from_millis, to_millis};

/// Lifecycle status of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Dispatched,
    Resolved,
    TimedOut,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "DISPATCHED",
            Self::Resolved => "RESOLVED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the entry can no longer change
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Dispatched)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DISPATCHED" => Ok(Self::Dispatched),
            "RESOLVED" => Ok(Self::Resolved),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::Other(format!("unknown entry status '{}'", s))),
        }
    }
}

/// One dispatch attempt and its eventual outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmLogEntry {
    /// Creation order
    pub id: i64,
    pub entry_id: String,
    pub action_kind: String,
    pub arm: Arm,
    /// Winning theta at selection time
    pub sampled_prob: f64,
    pub explored: bool,
    /// Goal mode and weights captured at selection time
    pub goal_mode: GoalMode,
    pub weights: GoalWeights,
    pub external_id: Option<String>,
    pub status: EntryStatus,
    pub reward_j: Option<f64>,
    /// Set on timeout resolutions so analysis can exclude them
    pub degraded: bool,
    pub signal: Option<RewardSignal>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ArmLogEntry {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.get("status");
        let goal_mode: String = row.get("goal_mode");
        let weights_json: String = row.get("weights_json");
        let weights: GoalWeights = serde_json::from_str(&weights_json)
            .map_err(|e| Error::Other(format!("corrupt weight snapshot: {}", e)))?;
        let signal = row
            .get::<Option<String>, _>("signal_json")
            .map(|json| serde_json::from_str::<RewardSignal>(&json))
            .transpose()
            .map_err(|e| Error::Other(format!("corrupt reward signal: {}", e)))?;

        Ok(Self {
            id: row.get("id"),
            entry_id: row.get("entry_id"),
            action_kind: row.get("action_kind"),
            arm: Arm::new(
                row.get::<String, _>("post_type"),
                row.get::<String, _>("topic"),
                row.get::<i64, _>("hour_bin") as u8,
                row.get::<String, _>("cta_variant"),
                row.get::<i64, _>("intensity") as u8,
            ),
            sampled_prob: row.get("sampled_prob"),
            explored: row.get::<i64, _>("explored") != 0,
            goal_mode: goal_mode.parse()?,
            weights,
            external_id: row.get("external_id"),
            status: status.parse()?,
            reward_j: row.get("reward_j"),
            degraded: row.get::<i64, _>("degraded") != 0,
            signal,
            error: row.get("error"),
            created_at: from_millis(row.get("created_at_ms")),
            resolved_at: row.get::<Option<i64>, _>("resolved_at_ms").map(from_millis),
        })
    }
}

/// A dispatch attempt about to be logged
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub action_kind: &'a str,
    pub selection: &'a Selection,
    pub goal: ActiveGoal,
    pub external_id: Option<String>,
    /// `None` for a successful dispatch; the failure otherwise
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How a pending entry leaves `DISPATCHED`
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { reward: f64, signal: RewardSignal },
    /// Neutral reward, flagged degraded
    TimedOut,
}

impl Resolution {
    fn status(&self) -> EntryStatus {
        match self {
            Self::Resolved { .. } => EntryStatus::Resolved,
            Self::TimedOut => EntryStatus::TimedOut,
        }
    }

    pub fn reward(&self) -> f64 {
        match self {
            Self::Resolved { reward, .. } => *reward,
            Self::TimedOut => 0.0,
        }
    }
}

/// Aggregate view over a slice of the log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogSummary {
    pub total: u64,
    pub dispatched: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub degraded: u64,
    pub explored: u64,
    /// Mean reward over RESOLVED entries
    pub mean_reward: Option<f64>,
}

impl LogSummary {
    /// Share of successful dispatches that came from the exploration override
    pub fn exploration_ratio(&self) -> Option<f64> {
        let attempts = self.total - self.failed;
        (attempts > 0).then(|| self.explored as f64 / attempts as f64)
    }
}

const ENTRY_COLUMNS: &str = r#"
    id, entry_id, action_kind, post_type, topic, hour_bin, cta_variant, intensity,
    sampled_prob, explored, goal_mode, weights_json, external_id, status, reward_j,
    degraded, signal_json, error, created_at_ms, resolved_at_ms
"#;

/// Store over the `arm_log` table
#[derive(Debug, Clone)]
pub struct ArmLogStore {
    pool: SqlitePool,
}

impl ArmLogStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Append one entry; `DISPATCHED` unless `new.error` is set, then `FAILED`
    pub async fn append(&self, new: &NewEntry<'_>) -> Result<ArmLogEntry> {
        let entry_id = Uuid::new_v4().to_string();
        let arm = &new.selection.arm;
        let status = if new.error.is_some() {
            EntryStatus::Failed
        } else {
            EntryStatus::Dispatched
        };
        let weights_json = serde_json::to_string(&new.goal.weights)
            .map_err(|e| Error::Other(format!("failed to encode weights: {}", e)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO arm_log (
                entry_id, action_kind, fingerprint, post_type, topic, hour_bin, cta_variant,
                intensity, sampled_prob, explored, goal_mode, weights_json, external_id,
                status, error, created_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry_id)
        .bind(new.action_kind)
        .bind(arm.fingerprint())
        .bind(&arm.post_type)
        .bind(&arm.topic)
        .bind(arm.hour_bin as i64)
        .bind(&arm.cta_variant)
        .bind(arm.intensity as i64)
        .bind(new.selection.sampled_prob)
        .bind(new.selection.explored as i64)
        .bind(new.goal.mode.as_str())
        .bind(&weights_json)
        .bind(&new.external_id)
        .bind(status.as_str())
        .bind(&new.error)
        .bind(to_millis(new.created_at))
        .execute(&self.pool)
        .await?;

        debug!(entry_id = %entry_id, status = %status, kind = new.action_kind, "Log entry appended");

        Ok(ArmLogEntry {
            id: result.last_insert_rowid(),
            entry_id,
            action_kind: new.action_kind.to_string(),
            arm: arm.clone(),
            sampled_prob: new.selection.sampled_prob,
            explored: new.selection.explored,
            goal_mode: new.goal.mode,
            weights: new.goal.weights,
            external_id: new.external_id.clone(),
            status,
            reward_j: None,
            degraded: false,
            signal: None,
            error: new.error.clone(),
            created_at: from_millis(to_millis(new.created_at)),
            resolved_at: None,
        })
    }

    pub async fn get(&self, entry_id: &str) -> Result<Option<ArmLogEntry>> {
        let sql = format!("SELECT {} FROM arm_log WHERE entry_id = ?", ENTRY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ArmLogEntry::from_row).transpose()
    }

    /// `DISPATCHED` entries created at or before `cutoff`, oldest first
    pub async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ArmLogEntry>> {
        let sql = format!(
            "SELECT {} FROM arm_log WHERE status = 'DISPATCHED' AND created_at_ms <= ? ORDER BY id",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(cutoff))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ArmLogEntry::from_row).collect()
    }

    /// Number of entries still awaiting an outcome
    pub async fn pending_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM arm_log WHERE status = 'DISPATCHED'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<ArmLogEntry>> {
        let sql = format!("SELECT {} FROM arm_log ORDER BY id DESC LIMIT ?", ENTRY_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ArmLogEntry::from_row).collect()
    }

    /// Raw signals of entries resolved at or after `since`, in resolution order
    pub async fn resolved_signals_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, RewardSignal)>> {
        let rows = sqlx::query(
            r#"
            SELECT resolved_at_ms, signal_json FROM arm_log
            WHERE status = 'RESOLVED' AND signal_json IS NOT NULL AND resolved_at_ms >= ?
            ORDER BY resolved_at_ms, id
            "#,
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("signal_json");
            let signal = serde_json::from_str(&json)
                .map_err(|e| Error::Other(format!("corrupt reward signal: {}", e)))?;
            out.push((from_millis(row.get("resolved_at_ms")), signal));
        }
        Ok(out)
    }

    /// Move a `DISPATCHED` entry to its final state and fold the reward into
    /// the arm's posterior, atomically.
    ///
    /// Returns `None` when the entry had already left `DISPATCHED`; nothing
    /// is written in that case, so repeated reconciliation is harmless.
    pub async fn resolve(
        &self,
        bandit: &BanditStore,
        entry: &ArmLogEntry,
        resolution: &Resolution,
        at: DateTime<Utc>,
    ) -> Result<Option<Posterior>> {
        let mut guard = bandit.lock_arm(&entry.arm).await?;
        let mut tx = bandit.pool().begin().await?;

        let (signal_json, degraded) = match resolution {
            Resolution::Resolved { signal, .. } => (
                Some(
                    serde_json::to_string(signal)
                        .map_err(|e| Error::Other(format!("failed to encode signal: {}", e)))?,
                ),
                false,
            ),
            Resolution::TimedOut => (None, true),
        };

        let updated = sqlx::query(
            r#"
            UPDATE arm_log
            SET status = ?, reward_j = ?, degraded = ?, signal_json = ?, resolved_at_ms = ?
            WHERE entry_id = ? AND status = 'DISPATCHED'
            "#,
        )
        .bind(resolution.status().as_str())
        .bind(resolution.reward())
        .bind(degraded as i64)
        .bind(&signal_json)
        .bind(to_millis(at))
        .bind(&entry.entry_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(entry_id = %entry.entry_id, "Entry already resolved; skipping");
            return Ok(None);
        }

        let posterior = apply_reward(&mut tx, &entry.arm, resolution.reward(), at).await?;
        tx.commit().await?;
        *guard = posterior;

        Ok(Some(posterior))
    }

    /// Counts per status for entries created at or after `since` (all when `None`)
    pub async fn summary(&self, since: Option<DateTime<Utc>>) -> Result<LogSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status = 'DISPATCHED'), 0) AS dispatched,
                COALESCE(SUM(status = 'RESOLVED'), 0) AS resolved,
                COALESCE(SUM(status = 'TIMED_OUT'), 0) AS timed_out,
                COALESCE(SUM(status = 'FAILED'), 0) AS failed,
                COALESCE(SUM(degraded), 0) AS degraded,
                COALESCE(SUM(explored AND status != 'FAILED'), 0) AS explored,
                AVG(CASE WHEN status = 'RESOLVED' THEN reward_j END) AS mean_reward
            FROM arm_log
            WHERE created_at_ms >= ?
            "#,
        )
        .bind(since.map(to_millis).unwrap_or(i64::MIN))
        .fetch_one(&self.pool)
        .await?;

        Ok(LogSummary {
            total: row.get::<i64, _>("total") as u64,
            dispatched: row.get::<i64, _>("dispatched") as u64,
            resolved: row.get::<i64, _>("resolved") as u64,
            timed_out: row.get::<i64, _>("timed_out") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            degraded: row.get::<i64, _>("degraded") as u64,
            explored: row.get::<i64, _>("explored") as u64,
            mean_reward: row.get("mean_reward"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::goals::GoalWeightTable;
    use chrono::Duration;

    fn selection() -> Selection {
        Selection {
            arm: Arm::new("proposal", "energy", 14, "join_pilot", 2),
            sampled_prob: 0.73,
            explored: false,
        }
    }

    fn goal(mode: GoalMode) -> ActiveGoal {
        ActiveGoal {
            mode,
            weights: GoalWeightTable::default().get(mode).unwrap(),
        }
    }

    async fn stores() -> (Database, ArmLogStore, BanditStore) {
        let db = Database::in_memory().await.unwrap();
        let log = ArmLogStore::new(&db);
        let bandit = BanditStore::new(&db);
        (db, log, bandit)
    }

    async fn dispatched(log: &ArmLogStore, at: DateTime<Utc>) -> ArmLogEntry {
        let selection = selection();
        log.append(&NewEntry {
            action_kind: "post",
            selection: &selection,
            goal: goal(GoalMode::Impact),
            external_id: Some("ext-1".to_string()),
            error: None,
            created_at: at,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let (_db, log, _bandit) = stores().await;
        let now = Utc::now();
        let entry = dispatched(&log, now).await;

        let loaded = log.get(&entry.entry_id).await.unwrap().unwrap();
        assert_eq!(loaded, entry);
        assert_eq!(loaded.status, EntryStatus::Dispatched);
        assert_eq!(loaded.weights, GoalWeights::new(0.40, 0.30, 0.20, 0.10));
        assert_eq!(loaded.reward_j, None);
    }

    #[tokio::test]
    async fn test_failed_entry_never_pending() {
        let (_db, log, _bandit) = stores().await;
        let now = Utc::now();
        let selection = selection();
        let entry = log
            .append(&NewEntry {
                action_kind: "post",
                selection: &selection,
                goal: goal(GoalMode::Fame),
                external_id: None,
                error: Some("429 rate limited".to_string()),
                created_at: now - Duration::hours(3),
            })
            .await
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(log.pending_older_than(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_respects_cutoff() {
        let (_db, log, _bandit) = stores().await;
        let now = Utc::now();
        dispatched(&log, now - Duration::hours(2)).await;
        dispatched(&log, now - Duration::minutes(10)).await;

        let pending = log.pending_older_than(now - Duration::hours(1)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(log.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resolve_updates_posterior_once() {
        let (_db, log, bandit) = stores().await;
        let now = Utc::now();
        let entry = dispatched(&log, now - Duration::hours(2)).await;
        let resolution = Resolution::Resolved {
            reward: 0.8,
            signal: RewardSignal::default().with_clicks(12),
        };

        let first = log.resolve(&bandit, &entry, &resolution, now).await.unwrap();
        let p = first.unwrap();
        assert!((p.alpha - 1.8).abs() < 1e-9 && (p.beta - 1.2).abs() < 1e-9);

        // A second pass over the same entry is a no-op
        assert!(log.resolve(&bandit, &entry, &resolution, now).await.unwrap().is_none());
        assert!(log.resolve(&bandit, &entry, &Resolution::TimedOut, now).await.unwrap().is_none());

        let p = bandit.get_or_init(&entry.arm).await.unwrap();
        assert!((p.alpha - 1.8).abs() < 1e-9);

        let stored = log.get(&entry.entry_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Resolved);
        assert_eq!(stored.reward_j, Some(0.8));
        assert_eq!(stored.signal.unwrap().clicks, Some(12));
        assert!(!stored.degraded);
    }

    #[tokio::test]
    async fn test_timeout_is_degraded_neutral_reward() {
        let (_db, log, bandit) = stores().await;
        let now = Utc::now();
        let entry = dispatched(&log, now - Duration::hours(49)).await;

        let p = log
            .resolve(&bandit, &entry, &Resolution::TimedOut, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p, Posterior::new(1.0, 2.0));

        let stored = log.get(&entry.entry_id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::TimedOut);
        assert_eq!(stored.reward_j, Some(0.0));
        assert!(stored.degraded);
    }

    #[tokio::test]
    async fn test_summary_and_signals() {
        let (_db, log, bandit) = stores().await;
        let now = Utc::now();
        let a = dispatched(&log, now - Duration::hours(3)).await;
        let b = dispatched(&log, now - Duration::hours(3)).await;
        dispatched(&log, now).await;

        let resolution = Resolution::Resolved {
            reward: 0.6,
            signal: RewardSignal::default().with_engagement(5, 1, 0, 0),
        };
        log.resolve(&bandit, &a, &resolution, now).await.unwrap();
        log.resolve(&bandit, &b, &Resolution::TimedOut, now).await.unwrap();

        let summary = log.summary(None).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.mean_reward, Some(0.6));
        assert_eq!(summary.exploration_ratio(), Some(0.0));

        let signals = log.resolved_signals_since(now - Duration::days(7)).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].1.likes, Some(5));
    }
}
