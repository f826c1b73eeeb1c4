//! Action scheduling and outcome reconciliation
//!
//! Each action kind runs its own jittered trigger. A cycle selects an arm,
//! hands it to the publisher and logs the decision without waiting for any
//! outcome. A separate reconciliation pass later turns outcome signals into
//! rewards and folds them into the posteriors exactly once.

pub mod collaborators;
pub mod log;
pub mod runner;
pub mod state;

pub use collaborators::{Analytics, Collaborators, Content, ContentGenerator, PublishReceipt, Publisher};
pub use log::{ArmLogEntry, ArmLogStore, EntryStatus, LogSummary, NewEntry, Resolution};
pub use runner::{ActionScheduler, CycleOutcome, ReconcileReport, SkipReason, local_hour};
pub use state::{ActionState, CycleGuard, KindState, StateTracker};
