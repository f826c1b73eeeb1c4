//! Storage layer - SQLite persistence
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! Posterior rows live in `arm_posteriors` (see [`crate::bandit::BanditStore`]);
//! decision-log rows live in `arm_log` (see [`crate::scheduler::ArmLogStore`]).
//!
//! # Usage
//!
//! ```ignore
//! use cadence_core::storage::Database;
//!
//! // In-memory database for tests
//! let db = Database::in_memory().await?;
//!
//! // File-backed database
//! let db = Database::open(&config.storage.database_path).await?;
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig, default_database_path};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};

use chrono::{DateTime, Utc};

/// Convert a timestamp to the unix-millisecond column format
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert a unix-millisecond column back to a timestamp
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
