//! Error types for Cadence

use thiserror::Error;

/// Result type alias using Cadence's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cadence error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Arm space errors (E001-E099)
    #[error("Invalid arm: {0}")]
    InvalidArm(String),

    // Dispatch errors (E100-E199)
    #[error("Dispatch failed: {0}")]
    DispatchFailure(String),

    // Outcome errors (E200-E299)
    #[error("Outcome unavailable for '{0}'. Will retry on the next reconciliation pass.")]
    OutcomeUnavailable(String),

    #[error("No outcome for entry '{0}' within the timeout window; resolved with neutral reward.")]
    TimeoutResolution(String),

    // Storage errors (E400-E499)
    #[error("Persistent store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("Scheduler halted: {0}")]
    SchedulerHalted(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown goal mode '{0}'. Valid modes: IMPACT, REVENUE, AUTHORITY, FAME, MONETIZE.")]
    UnknownGoalMode(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArm(_) => "E001",
            Self::DispatchFailure(_) => "E100",
            Self::OutcomeUnavailable(_) => "E200",
            Self::TimeoutResolution(_) => "E201",
            Self::StoreUnavailable(_) => "E400",
            Self::SchedulerHalted(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::UnknownGoalMode(_) => "E601",
            Self::InvalidInput(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidArm(_) => Some("cadence config list".to_string()),
            Self::StoreUnavailable(_) | Self::SchedulerHalted(_) => {
                Some("cadence doctor".to_string())
            }
            Self::UnknownGoalMode(_) => Some("cadence mode set IMPACT".to_string()),
            Self::ConfigError(_) => Some("cadence config list".to_string()),
            _ => None,
        }
    }

    /// Whether this error must stop scheduling.
    ///
    /// Only durable-state failures are fatal; everything else is isolated to
    /// the attempt that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::SchedulerHalted(_))
    }
}
