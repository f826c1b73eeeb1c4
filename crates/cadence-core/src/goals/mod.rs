//! Goal modes and the active objective weight vector
//!
//! A goal mode is a named preset of objective weights. The
//! [`GoalModeController`] holds the active vector and swaps it atomically;
//! every decision captures a snapshot of the vector at selection time, so a
//! later switch never rewrites how an earlier action is scored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{Error, Result};

/// Named objective preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GoalMode {
    Impact,
    Revenue,
    Authority,
    Fame,
    Monetize,
}

impl GoalMode {
    pub const ALL: [GoalMode; 5] = [
        GoalMode::Impact,
        GoalMode::Revenue,
        GoalMode::Authority,
        GoalMode::Fame,
        GoalMode::Monetize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impact => "IMPACT",
            Self::Revenue => "REVENUE",
            Self::Authority => "AUTHORITY",
            Self::Fame => "FAME",
            Self::Monetize => "MONETIZE",
        }
    }
}

impl fmt::Display for GoalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GoalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "IMPACT" => Ok(Self::Impact),
            "REVENUE" => Ok(Self::Revenue),
            "AUTHORITY" => Ok(Self::Authority),
            "FAME" => Ok(Self::Fame),
            "MONETIZE" => Ok(Self::Monetize),
            _ => Err(Error::UnknownGoalMode(s.to_string())),
        }
    }
}

/// Objective weights: `J = fame·E + revenue·R + authority·A − penalty·P`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoalWeights {
    pub fame: f64,
    pub revenue: f64,
    pub authority: f64,
    pub penalty: f64,
}

impl GoalWeights {
    pub const fn new(fame: f64, revenue: f64, authority: f64, penalty: f64) -> Self {
        Self {
            fame,
            revenue,
            authority,
            penalty,
        }
    }

    /// Total weight of the positive terms
    pub fn positive_mass(&self) -> f64 {
        self.fame + self.revenue + self.authority
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.fame, self.revenue, self.authority, self.penalty];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::ConfigError(format!(
                "goal weights must be finite and non-negative: {:?}",
                self
            )));
        }
        if self.positive_mass() <= 0.0 {
            return Err(Error::ConfigError(
                "at least one positive goal weight is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Weight vector for every goal mode.
///
/// Serialized as a map keyed by mode name; modes missing from the input keep
/// their default vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, GoalWeights>",
    into = "BTreeMap<String, GoalWeights>"
)]
pub struct GoalWeightTable(BTreeMap<GoalMode, GoalWeights>);

impl Default for GoalWeightTable {
    fn default() -> Self {
        let revenue = GoalWeights::new(0.30, 0.55, 0.25, 0.25);
        let mut table = BTreeMap::new();
        table.insert(GoalMode::Impact, GoalWeights::new(0.40, 0.30, 0.20, 0.10));
        table.insert(GoalMode::Revenue, revenue);
        table.insert(GoalMode::Authority, GoalWeights::new(0.45, 0.20, 0.25, 0.10));
        table.insert(GoalMode::Fame, GoalWeights::new(0.65, 0.15, 0.25, 0.20));
        table.insert(GoalMode::Monetize, revenue);
        Self(table)
    }
}

impl TryFrom<BTreeMap<String, GoalWeights>> for GoalWeightTable {
    type Error = Error;

    fn try_from(raw: BTreeMap<String, GoalWeights>) -> Result<Self> {
        let mut table = Self::default();
        for (name, weights) in raw {
            table.set(name.parse()?, weights);
        }
        Ok(table)
    }
}

impl From<GoalWeightTable> for BTreeMap<String, GoalWeights> {
    fn from(table: GoalWeightTable) -> Self {
        table
            .0
            .into_iter()
            .map(|(mode, weights)| (mode.to_string(), weights))
            .collect()
    }
}

impl GoalWeightTable {
    pub fn get(&self, mode: GoalMode) -> Option<GoalWeights> {
        self.0.get(&mode).copied()
    }

    pub fn set(&mut self, mode: GoalMode, weights: GoalWeights) {
        self.0.insert(mode, weights);
    }

    pub fn modes(&self) -> impl Iterator<Item = GoalMode> + '_ {
        self.0.keys().copied()
    }

    pub fn validate(&self) -> Result<()> {
        for (mode, weights) in &self.0 {
            weights
                .validate()
                .map_err(|e| Error::ConfigError(format!("{}: {}", mode, e)))?;
        }
        Ok(())
    }
}

/// The active mode together with its weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveGoal {
    pub mode: GoalMode,
    pub weights: GoalWeights,
}

#[derive(Debug)]
struct ControllerState {
    table: GoalWeightTable,
    active: Arc<ActiveGoal>,
}

/// Holds the active weight vector and swaps it atomically
#[derive(Debug)]
pub struct GoalModeController {
    state: RwLock<ControllerState>,
}

impl GoalModeController {
    /// Create a controller with `mode` active
    pub fn new(table: GoalWeightTable, mode: GoalMode) -> Result<Self> {
        table.validate()?;
        let weights = table
            .get(mode)
            .ok_or_else(|| Error::UnknownGoalMode(mode.to_string()))?;
        Ok(Self {
            state: RwLock::new(ControllerState {
                table,
                active: Arc::new(ActiveGoal { mode, weights }),
            }),
        })
    }

    /// Swap the active weight vector
    pub fn set_mode(&self, mode: GoalMode) -> Result<ActiveGoal> {
        let mut state = self.write_state();
        let weights = state
            .table
            .get(mode)
            .ok_or_else(|| Error::UnknownGoalMode(mode.to_string()))?;
        let previous = state.active.mode;
        state.active = Arc::new(ActiveGoal { mode, weights });
        info!(from = %previous, to = %mode, ?weights, "Goal mode switched");
        Ok(*state.active)
    }

    /// Snapshot of the active weights
    pub fn current_weights(&self) -> GoalWeights {
        self.current().weights
    }

    /// Snapshot of the active mode and weights
    pub fn current(&self) -> ActiveGoal {
        *self.read_state().active
    }

    pub fn current_mode(&self) -> GoalMode {
        self.current().mode
    }

    /// Replace the weight table (hot reload); re-derives the active vector
    pub fn replace_table(&self, table: GoalWeightTable) -> Result<()> {
        table.validate()?;
        let mut state = self.write_state();
        let mode = state.active.mode;
        let weights = table
            .get(mode)
            .ok_or_else(|| Error::UnknownGoalMode(mode.to_string()))?;
        state.table = table;
        state.active = Arc::new(ActiveGoal { mode, weights });
        Ok(())
    }

    // A poisoned lock only means a panic happened mid-swap of an Arc; the
    // data is still a complete value.
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ControllerState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ControllerState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
