//! Bandit learner: Beta posteriors, their durable store, and Thompson sampling
//!
//! - `posterior`: the Beta(alpha, beta) belief and the continuous update rule
//! - `store`: SQLite-backed posterior state with per-arm locking
//! - `sampler`: Thompson sampling with an epsilon exploration floor

pub mod posterior;
pub mod sampler;
pub mod store;

pub use posterior::Posterior;
pub use sampler::{DEFAULT_EPSILON, Selection, ThompsonSampler};
pub use store::{ArmPosterior, BanditStore};
