//! Per-action-kind decision state machine
//!
//! ```text
//! IDLE → SELECTING → DISPATCHED → AWAITING_OUTCOME → {RESOLVED | TIMED_OUT}
//!            │            │
//!            └────────────┴──────→ FAILED
//! ```
//!
//! A cycle owns its kind's slot from SELECTING until it hands the entry over
//! to reconciliation (AWAITING_OUTCOME) or fails. While a slot is owned no
//! other cycle of that kind may start; other kinds are unaffected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    Idle,
    Selecting,
    Dispatched,
    AwaitingOutcome,
    Resolved,
    TimedOut,
    Failed,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Selecting => "SELECTING",
            Self::Dispatched => "DISPATCHED",
            Self::AwaitingOutcome => "AWAITING_OUTCOME",
            Self::Resolved => "RESOLVED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Idle, Selecting)
                | (Selecting, Dispatched)
                | (Selecting, Failed)
                | (Dispatched, AwaitingOutcome)
                | (Dispatched, Failed)
                | (AwaitingOutcome, Resolved)
                | (AwaitingOutcome, TimedOut)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::TimedOut | Self::Failed)
    }

    /// Whether a cycle in this state blocks a new cycle of the same kind
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Selecting | Self::Dispatched)
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: ActionState,
    last_outcome: Option<ActionState>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: ActionState::Idle,
            last_outcome: None,
        }
    }
}

/// Observable state of one action kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindState {
    pub kind: String,
    pub state: ActionState,
    /// Where the previous cycle ended
    pub last_outcome: Option<ActionState>,
}

type Slots = Arc<Mutex<BTreeMap<String, Slot>>>;

/// Single-flight bookkeeping for every action kind
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    slots: Slots,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `kind` and move it to SELECTING.
    ///
    /// Returns `None` while a previous cycle of the same kind is still in
    /// flight.
    pub fn try_begin(&self, kind: &str) -> Option<CycleGuard> {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(kind.to_string()).or_default();
        if slot.state.is_in_flight() {
            return None;
        }
        slot.state = ActionState::Selecting;
        Some(CycleGuard {
            slots: Arc::clone(&self.slots),
            kind: kind.to_string(),
            state: ActionState::Selecting,
        })
    }

    pub fn state(&self, kind: &str) -> ActionState {
        lock(&self.slots)
            .get(kind)
            .map(|s| s.state)
            .unwrap_or(ActionState::Idle)
    }

    pub fn snapshot(&self) -> Vec<KindState> {
        lock(&self.slots)
            .iter()
            .map(|(kind, slot)| KindState {
                kind: kind.clone(),
                state: slot.state,
                last_outcome: slot.last_outcome,
            })
            .collect()
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, BTreeMap<String, Slot>> {
    slots.lock().unwrap_or_else(|p| p.into_inner())
}

/// Ownership of one kind's slot for the duration of a cycle.
///
/// Dropping the guard releases the slot back to IDLE, whichever way the cycle
/// ended.
#[derive(Debug)]
pub struct CycleGuard {
    slots: Slots,
    kind: String,
    state: ActionState,
}

impl CycleGuard {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn advance(&mut self, next: ActionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Other(format!(
                "illegal transition {} -> {} for '{}'",
                self.state, next, self.kind
            )));
        }
        self.state = next;
        if let Some(slot) = lock(&self.slots).get_mut(&self.kind) {
            slot.state = next;
        }
        Ok(())
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if let Some(slot) = lock(&self.slots).get_mut(&self.kind) {
            slot.last_outcome = (self.state != ActionState::Selecting).then_some(self.state);
            slot.state = ActionState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ActionState::*;
        assert!(Idle.can_transition_to(Selecting));
        assert!(Selecting.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(AwaitingOutcome));
        assert!(AwaitingOutcome.can_transition_to(TimedOut));
        assert!(Dispatched.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Dispatched));
        assert!(!Failed.can_transition_to(Resolved));
        assert!(!TimedOut.can_transition_to(Resolved));
        assert!(!Selecting.can_transition_to(AwaitingOutcome));
        assert!(Failed.is_terminal() && !AwaitingOutcome.is_terminal());
    }

    #[test]
    fn test_single_flight_per_kind() {
        let tracker = StateTracker::new();
        let post = tracker.try_begin("post").unwrap();
        assert!(tracker.try_begin("post").is_none());

        // Another kind proceeds concurrently
        let question = tracker.try_begin("question");
        assert!(question.is_some());

        drop(post);
        assert_eq!(tracker.state("post"), ActionState::Idle);
        assert!(tracker.try_begin("post").is_some());
    }

    #[test]
    fn test_awaiting_outcome_releases_slot() {
        let tracker = StateTracker::new();
        {
            let mut cycle = tracker.try_begin("post").unwrap();
            cycle.advance(ActionState::Dispatched).unwrap();
            assert_eq!(tracker.state("post"), ActionState::Dispatched);
            assert!(tracker.try_begin("post").is_none());
            cycle.advance(ActionState::AwaitingOutcome).unwrap();
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, ActionState::Idle);
        assert_eq!(snapshot[0].last_outcome, Some(ActionState::AwaitingOutcome));
    }

    #[test]
    fn test_illegal_advance_rejected() {
        let tracker = StateTracker::new();
        let mut cycle = tracker.try_begin("post").unwrap();
        assert!(cycle.advance(ActionState::Resolved).is_err());
        assert_eq!(cycle.state(), ActionState::Selecting);
    }
}
