//! Database migrations
//!
//! Versioned SQLite schema for cadence. Migrations are applied automatically
//! when a [`Database`](super::Database) is opened.

use sqlx::{Row, SqlitePool};

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: posteriors and the decision log
const MIGRATION_V1: &str = r#"
    -- Per-arm Beta posteriors, keyed by the arm fingerprint
    CREATE TABLE IF NOT EXISTS arm_posteriors (
        fingerprint TEXT PRIMARY KEY NOT NULL,
        post_type TEXT NOT NULL,
        topic TEXT NOT NULL,
        hour_bin INTEGER NOT NULL,
        cta_variant TEXT NOT NULL,
        intensity INTEGER NOT NULL,
        alpha REAL NOT NULL DEFAULT 1.0 CHECK (alpha > 0),
        beta REAL NOT NULL DEFAULT 1.0 CHECK (beta > 0),
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );

    -- Append-only decision log; id gives creation order
    CREATE TABLE IF NOT EXISTS arm_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id TEXT NOT NULL UNIQUE,
        action_kind TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        post_type TEXT NOT NULL,
        topic TEXT NOT NULL,
        hour_bin INTEGER NOT NULL,
        cta_variant TEXT NOT NULL,
        intensity INTEGER NOT NULL,
        sampled_prob REAL NOT NULL,
        explored INTEGER NOT NULL DEFAULT 0,
        goal_mode TEXT NOT NULL,
        weights_json TEXT NOT NULL,
        external_id TEXT,
        status TEXT NOT NULL CHECK (status IN ('DISPATCHED', 'RESOLVED', 'TIMED_OUT', 'FAILED')),
        reward_j REAL,
        degraded INTEGER NOT NULL DEFAULT 0,
        signal_json TEXT,
        error TEXT,
        created_at_ms INTEGER NOT NULL,
        resolved_at_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_arm_log_status_created ON arm_log(status, created_at_ms);
    CREATE INDEX IF NOT EXISTS idx_arm_log_fingerprint ON arm_log(fingerprint);
"#;

/// Migration 2: lookups used by reporting and window rebuilds
const MIGRATION_V2: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_arm_log_resolved_at ON arm_log(resolved_at_ms);
    CREATE INDEX IF NOT EXISTS idx_arm_log_kind ON arm_log(action_kind);
    CREATE INDEX IF NOT EXISTS idx_arm_posteriors_mean ON arm_posteriors(alpha, beta);
"#;

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.current_version >= self.target_version
    }
}

async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("version") as i32)
}

async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Apply all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Posteriors and decision log");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Reporting indexes");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    Ok(())
}

/// Report the applied and target schema versions
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    Ok(MigrationStatus {
        current_version: get_current_version(pool).await?,
        target_version: CURRENT_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        run_migrations(db.pool()).await.unwrap();
        run_migrations(db.pool()).await.unwrap();

        let status = migration_status(db.pool()).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_status_constraint_enforced() {
        let db = Database::in_memory().await.unwrap();
        let result = sqlx::query(
            r#"INSERT INTO arm_log (entry_id, action_kind, fingerprint, post_type, topic, hour_bin,
                cta_variant, intensity, sampled_prob, goal_mode, weights_json, status, created_at_ms)
               VALUES ('e1', 'post', 'fp', 'proposal', 'energy', 14, 'learn_more', 2, 0.5,
                'IMPACT', '{}', 'PENDING', 0)"#,
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err());
    }
}
