//! Durable per-arm posterior state
//!
//! SQLite is the source of truth (`arm_posteriors`, keyed by arm
//! fingerprint). An in-process cache keeps one mutex per arm so that a
//! reconciliation write and a concurrent selection never lose an update,
//! without a global lock across arms.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::posterior::Posterior;
use crate::arms::Arm;
use crate::error::{Error, Result};
use crate::storage::{Database, to_millis};

type ArmCell = Arc<Mutex<Posterior>>;

/// An arm together with its current posterior
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmPosterior {
    pub arm: Arm,
    pub posterior: Posterior,
}

impl ArmPosterior {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            arm: Arm::new(
                row.get::<String, _>("post_type"),
                row.get::<String, _>("topic"),
                row.get::<i64, _>("hour_bin") as u8,
                row.get::<String, _>("cta_variant"),
                row.get::<i64, _>("intensity") as u8,
            ),
            posterior: Posterior::new(row.get("alpha"), row.get("beta")),
        }
    }
}

/// Store of Beta posteriors, one per arm
pub struct BanditStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, ArmCell>>,
}

impl BanditStore {
    pub fn new(db: &Database) -> Self {
        Self::from_pool(db.pool().clone())
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current posterior for `arm`, creating the uniform prior on first use
    pub async fn get_or_init(&self, arm: &Arm) -> Result<Posterior> {
        let cell = self.cell(arm).await?;
        let posterior = *cell.lock().await;
        Ok(posterior)
    }

    /// Posteriors for many arms, in input order.
    ///
    /// Cache misses are created and loaded in one transaction.
    pub async fn get_or_init_many(&self, arms: &[Arm]) -> Result<Vec<Posterior>> {
        let fingerprints: Vec<String> = arms.iter().map(Arm::fingerprint).collect();

        let missing: Vec<usize> = {
            let cache = self.cache.read().await;
            (0..arms.len())
                .filter(|i| !cache.contains_key(&fingerprints[*i]))
                .collect()
        };

        if !missing.is_empty() {
            let now = Utc::now();
            let mut loaded = Vec::with_capacity(missing.len());
            let mut tx = self.pool.begin().await?;
            for &i in &missing {
                let posterior = load_or_insert(&mut tx, &arms[i], &fingerprints[i], now).await?;
                loaded.push((i, posterior));
            }
            tx.commit().await?;

            let mut cache = self.cache.write().await;
            for (i, posterior) in loaded {
                cache
                    .entry(fingerprints[i].clone())
                    .or_insert_with(|| Arc::new(Mutex::new(posterior)));
            }
            debug!(created = missing.len(), "Loaded posteriors into cache");
        }

        // One cell per input arm, so results stay aligned with `arms`
        let cells: Vec<ArmCell> = {
            let cache = self.cache.read().await;
            fingerprints
                .iter()
                .map(|fp| {
                    cache.get(fp).cloned().ok_or_else(|| {
                        Error::Other(format!("posterior {} missing from cache", fp))
                    })
                })
                .collect::<Result<_>>()?
        };

        let mut posteriors = Vec::with_capacity(cells.len());
        for cell in cells {
            posteriors.push(*cell.lock().await);
        }
        Ok(posteriors)
    }

    /// Fold a reward in [0, 1] into the arm's posterior.
    ///
    /// The scheduler goes through [`ArmLogStore::resolve`](crate::scheduler::ArmLogStore::resolve)
    /// instead, which ties the update to a log-entry transition.
    pub async fn update(&self, arm: &Arm, reward: f64) -> Result<Posterior> {
        let mut guard = self.lock_arm(arm).await?;
        let mut conn = self.pool.acquire().await?;
        let posterior = apply_reward(&mut conn, arm, reward, Utc::now()).await?;
        *guard = posterior;
        debug!(arm = %arm, reward, alpha = posterior.alpha, beta = posterior.beta, "Posterior updated");
        Ok(posterior)
    }

    /// Arms ordered by posterior mean, highest first
    pub async fn top_arms(&self, limit: usize) -> Result<Vec<ArmPosterior>> {
        let rows = sqlx::query(
            r#"
            SELECT post_type, topic, hour_bin, cta_variant, intensity, alpha, beta
            FROM arm_posteriors
            ORDER BY alpha / (alpha + beta) DESC, (alpha + beta) DESC, fingerprint ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ArmPosterior::from_row).collect())
    }

    /// Posteriors that have absorbed at least one reward
    pub async fn observed(&self) -> Result<Vec<ArmPosterior>> {
        let rows = sqlx::query(
            r#"
            SELECT post_type, topic, hour_bin, cta_variant, intensity, alpha, beta
            FROM arm_posteriors
            WHERE alpha + beta > 2.0
            ORDER BY fingerprint
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ArmPosterior::from_row).collect())
    }

    /// Number of arms with a stored posterior
    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM arm_posteriors")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Hold the per-arm lock; callers write the new posterior through the guard
    pub(crate) async fn lock_arm(&self, arm: &Arm) -> Result<OwnedMutexGuard<Posterior>> {
        let cell = self.cell(arm).await?;
        Ok(cell.lock_owned().await)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn cell(&self, arm: &Arm) -> Result<ArmCell> {
        let fingerprint = arm.fingerprint();
        if let Some(cell) = self.cache.read().await.get(&fingerprint) {
            return Ok(Arc::clone(cell));
        }

        let mut conn = self.pool.acquire().await?;
        let posterior = load_or_insert(&mut conn, arm, &fingerprint, Utc::now()).await?;

        let mut cache = self.cache.write().await;
        let cell = cache
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(Mutex::new(posterior)));
        Ok(Arc::clone(cell))
    }
}

async fn load_or_insert(
    conn: &mut SqliteConnection,
    arm: &Arm,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<Posterior> {
    let now_ms = to_millis(now);
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO arm_posteriors (
            fingerprint, post_type, topic, hour_bin, cta_variant, intensity,
            alpha, beta, created_at_ms, updated_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, 1.0, 1.0, ?, ?)
        "#,
    )
    .bind(fingerprint)
    .bind(&arm.post_type)
    .bind(&arm.topic)
    .bind(arm.hour_bin as i64)
    .bind(&arm.cta_variant)
    .bind(arm.intensity as i64)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT alpha, beta FROM arm_posteriors WHERE fingerprint = ?")
        .bind(fingerprint)
        .fetch_one(&mut *conn)
        .await?;

    Ok(Posterior::new(row.get("alpha"), row.get("beta")))
}

/// Atomic `alpha += r, beta += 1 - r` on the stored row; returns the new value
pub(crate) async fn apply_reward(
    conn: &mut SqliteConnection,
    arm: &Arm,
    reward: f64,
    now: DateTime<Utc>,
) -> Result<Posterior> {
    let delta = Posterior::uniform().updated(reward);
    let (d_alpha, d_beta) = (delta.alpha - 1.0, delta.beta - 1.0);
    let now_ms = to_millis(now);

    let row = sqlx::query(
        r#"
        INSERT INTO arm_posteriors (
            fingerprint, post_type, topic, hour_bin, cta_variant, intensity,
            alpha, beta, created_at_ms, updated_at_ms
        ) VALUES (?, ?, ?, ?, ?, ?, 1.0 + ?, 1.0 + ?, ?, ?)
        ON CONFLICT(fingerprint) DO UPDATE SET
            alpha = alpha + ?,
            beta = beta + ?,
            updated_at_ms = excluded.updated_at_ms
        RETURNING alpha, beta
        "#,
    )
    .bind(arm.fingerprint())
    .bind(&arm.post_type)
    .bind(&arm.topic)
    .bind(arm.hour_bin as i64)
    .bind(&arm.cta_variant)
    .bind(arm.intensity as i64)
    .bind(d_alpha)
    .bind(d_beta)
    .bind(now_ms)
    .bind(now_ms)
    .bind(d_alpha)
    .bind(d_beta)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Posterior::new(row.get("alpha"), row.get("beta")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm_a() -> Arm {
        Arm::new("proposal", "energy", 14, "join_pilot", 2)
    }

    async fn store() -> (Database, BanditStore) {
        let db = Database::in_memory().await.unwrap();
        let store = BanditStore::new(&db);
        (db, store)
    }

    #[tokio::test]
    async fn test_lazy_uniform_prior() {
        let (_db, store) = store().await;
        assert_eq!(store.count().await.unwrap(), 0);

        let p = store.get_or_init(&arm_a()).await.unwrap();
        assert_eq!(p, Posterior::uniform());
        assert_eq!(store.count().await.unwrap(), 1);

        // Second call does not create another row
        store.get_or_init(&arm_a()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let (db, store) = store().await;
        let p = store.update(&arm_a(), 0.8).await.unwrap();
        assert!((p.alpha - 1.8).abs() < 1e-9);
        assert!((p.beta - 1.2).abs() < 1e-9);

        // A fresh store over the same database sees the update
        let reopened = BanditStore::new(&db);
        let p = reopened.get_or_init(&arm_a()).await.unwrap();
        assert!((p.alpha - 1.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_get_or_init_many_preserves_order() {
        let (_db, store) = store().await;
        let b = Arm::new("thread", "policy", 9, "learn_more", 1);
        store.update(&b, 1.0).await.unwrap();

        let posteriors = store.get_or_init_many(&[arm_a(), b.clone()]).await.unwrap();
        assert_eq!(posteriors.len(), 2);
        assert_eq!(posteriors[0], Posterior::uniform());
        assert_eq!(posteriors[1], Posterior::new(2.0, 1.0));
    }

    #[tokio::test]
    async fn test_get_or_init_many_one_result_per_candidate() {
        let (_db, store) = store().await;
        let cached = Arm::new("thread", "policy", 9, "learn_more", 1);
        store.update(&cached, 0.0).await.unwrap();
        let fresh = Arm::new("insight", "energy", 10, "book_call", 3);

        let arms = [fresh.clone(), cached.clone(), fresh.clone(), arm_a()];
        let posteriors = store.get_or_init_many(&arms).await.unwrap();
        assert_eq!(posteriors.len(), arms.len());
        assert_eq!(posteriors[1], Posterior::new(1.0, 2.0));
        assert_eq!(posteriors[0], Posterior::uniform());
        assert_eq!(posteriors[2], posteriors[0]);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let db = Database::new(crate::storage::DatabaseConfig::in_memory()).await.unwrap();
        let store = Arc::new(BanditStore::new(&db));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.update(&arm_a(), 1.0).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let p = store.get_or_init(&arm_a()).await.unwrap();
        assert!((p.alpha - 21.0).abs() < 1e-9);
        assert!((p.beta - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_top_arms_by_mean() {
        let (_db, store) = store().await;
        let good = Arm::new("insight", "energy", 10, "book_call", 3);
        let bad = Arm::new("thread", "policy", 9, "learn_more", 1);
        store.update(&good, 1.0).await.unwrap();
        store.update(&bad, 0.0).await.unwrap();
        store.get_or_init(&arm_a()).await.unwrap();

        let top = store.top_arms(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].arm, good);
        assert_eq!(top[1].arm, arm_a());
    }
}
