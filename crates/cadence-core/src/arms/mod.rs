//! Arm space: the decision dimensions, their legal domains, and candidate
//! enumeration for a decision cycle.

pub mod space;
pub mod types;

pub use space::{ArmSpace, DEFAULT_TOP_K, DimensionHistory, Recommendation, ValueStats};
pub use types::{Arm, ArmDomains, ArmFilter, Dimension};
