//! Cadence Core Library
//!
//! The decision core of an autonomous posting agent:
//! - Arm space (decision dimensions, pruned candidate enumeration)
//! - Reward model (outcome signals to a composite objective in [0, 1])
//! - Bandit store and Thompson sampler (durable Beta posteriors)
//! - Goal modes (hot-swappable objective weights)
//! - Action scheduler (dispatch and delayed outcome reconciliation)
//! - Storage (SQLite), configuration, health, and an offline simulator

pub mod arms;
pub mod bandit;
pub mod config;
pub mod error;
pub mod goals;
pub mod health;
pub mod reward;
pub mod scheduler;
pub mod sim;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::arms::{Arm, ArmSpace};
    pub use crate::bandit::{BanditStore, Posterior, ThompsonSampler};
    pub use crate::config::{Config, ConfigHandle};
    pub use crate::error::{Error, Result};
    pub use crate::goals::{GoalMode, GoalModeController};
    pub use crate::reward::{RewardModel, RewardSignal};
    pub use crate::scheduler::{ActionScheduler, Collaborators};
    pub use crate::storage::Database;
}
