//! Health checks and diagnostics
//!
//! A halted scheduler (persistent store unavailable) is the one
//! health-critical condition; it reports as [`HealthStatus::Error`].

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::scheduler::{ActionScheduler, ArmLogStore};
use crate::storage::Database;

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthCheck {
    fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: Some(message.into()),
        }
    }
}

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

/// Overall system health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: String,
}

impl HealthReport {
    fn from_checks(checks: Vec<HealthCheck>, now: DateTime<Utc>) -> Self {
        let overall_status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Ok);
        Self {
            overall_status,
            checks,
            timestamp: now.to_rfc3339(),
        }
    }

    pub fn is_critical(&self) -> bool {
        self.overall_status == HealthStatus::Error
    }
}

/// Run all health checks (doctor command).
///
/// `scheduler` is only available inside a running daemon; without it the
/// halt check is skipped.
pub async fn doctor(
    db: &Database,
    config: &Config,
    config_path: Option<&Path>,
    scheduler: Option<&ActionScheduler>,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut checks = vec![check_database(db).await];
    if checks[0].status != HealthStatus::Error {
        checks.push(check_migrations(db).await);
        checks.push(check_backlog(db, config, now).await);
    }
    checks.push(check_config(config, config_path));
    if let Some(scheduler) = scheduler {
        checks.push(check_scheduler(scheduler));
    }
    HealthReport::from_checks(checks, now)
}

async fn check_database(db: &Database) -> HealthCheck {
    match db.health_check().await {
        Ok(()) => HealthCheck::new(
            "Database",
            HealthStatus::Ok,
            format!("Connected at {}", db.path().display()),
        ),
        Err(e) => HealthCheck::new("Database", HealthStatus::Error, format!("Query failed: {}", e)),
    }
}

async fn check_migrations(db: &Database) -> HealthCheck {
    match db.migration_status().await {
        Ok(status) if status.is_up_to_date() => HealthCheck::new(
            "Migrations",
            HealthStatus::Ok,
            format!("Schema at version {}", status.current_version),
        ),
        Ok(status) => HealthCheck::new(
            "Migrations",
            HealthStatus::Warning,
            format!(
                "Schema at version {} of {}",
                status.current_version, status.target_version
            ),
        ),
        Err(e) => HealthCheck::new("Migrations", HealthStatus::Error, e.to_string()),
    }
}

/// Pending entries past the timeout mean reconciliation is not running
async fn check_backlog(db: &Database, config: &Config, now: DateTime<Utc>) -> HealthCheck {
    let log = ArmLogStore::new(db);
    let overdue_cutoff = now - config.scheduler.timeout() - config.scheduler.resolve_grace();
    let (pending, overdue) = match (
        log.pending_count().await,
        log.pending_older_than(overdue_cutoff).await,
    ) {
        (Ok(pending), Ok(overdue)) => (pending, overdue.len()),
        (Err(e), _) | (_, Err(e)) => {
            return HealthCheck::new("Outcome backlog", HealthStatus::Error, e.to_string());
        }
    };

    if overdue > 0 {
        HealthCheck::new(
            "Outcome backlog",
            HealthStatus::Warning,
            format!("{} pending, {} past the timeout window", pending, overdue),
        )
    } else {
        HealthCheck::new(
            "Outcome backlog",
            HealthStatus::Ok,
            format!("{} awaiting outcome", pending),
        )
    }
}

fn check_config(config: &Config, path: Option<&Path>) -> HealthCheck {
    if let Err(e) = config.validate() {
        return HealthCheck::new("Configuration", HealthStatus::Error, format!("{:#}", e));
    }
    match path {
        Some(path) if path.exists() => HealthCheck::new(
            "Configuration",
            HealthStatus::Ok,
            format!("Found at {}", path.display()),
        ),
        Some(path) => HealthCheck::new(
            "Configuration",
            HealthStatus::Warning,
            format!("Not found at {} (using defaults)", path.display()),
        ),
        None => HealthCheck::new("Configuration", HealthStatus::Ok, "In-memory configuration"),
    }
}

fn check_scheduler(scheduler: &ActionScheduler) -> HealthCheck {
    match scheduler.halt_reason() {
        Some(reason) => HealthCheck::new(
            "Scheduler",
            HealthStatus::Error,
            format!("Halted: {}", reason),
        ),
        None => HealthCheck::new("Scheduler", HealthStatus::Ok, "Running"),
    }
}
