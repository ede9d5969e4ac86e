//! Probabilistic beach-volleyball point simulator and sensitivity analyzer.
//!
//! The crate models a single rally as a Markov process over a closed set of
//! states, runs large seeded batches of independent rallies in parallel, and
//! attributes point-winning probability to the input statistics by fitting a
//! classifier over a perturbed synthetic dataset.
//!
//! Three entry points:
//! - [`simulate`]: N rallies, aggregated win counts with a confidence
//!   interval.
//! - [`attribute`]: ranked feature importances, marginal impacts, and
//!   SHAP-style additive attributions.
//! - [`single_rally`]: one rally with its full trajectory, for tests and
//!   debugging.
//!
//! The core is stateless across calls and does no I/O besides the opt-in
//! attribution model cache.

pub mod attribution;
pub mod conditional;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod gbt;
pub mod kernel;
pub mod logistic;
pub mod metrics;
pub mod rally;
pub mod team_stats;

pub use attribution::{
    AttributionConfig, AttributionReport, FeatureImportance, ModelKind, ShapSample, ShapValue,
    attribute,
};
pub use conditional::{AttackRow, ConditionalModel};
pub use dataset::{PerturbConfig, RallyDataset, generate_dataset};
pub use driver::{
    CancelToken, MomentumConfig, ServeSchedule, SimOptions, SimulationResult, simulate,
};
pub use error::SimError;
pub use kernel::{Quality, RallyState};
pub use rally::{RallyContext, RallyOutcome, single_rally};
pub use team_stats::{FeatureCategory, TeamId, TeamStats};
