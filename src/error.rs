use thiserror::Error;

use crate::attribution::AttributionReport;

/// Exhaustive error taxonomy for the simulation core. Every failure mode is a
/// typed kind with a machine-readable shape; nothing inside the core retries.
#[derive(Debug, Error)]
pub enum SimError {
    /// A rate is out of range, a distribution does not sum to 1 within
    /// tolerance, or a conditional table is malformed. Fatal to the call.
    #[error("invalid stats: {field} = {value}: {message}")]
    InvalidStats {
        field: String,
        value: f64,
        message: String,
    },

    /// A rally failed to reach a terminal state within its step budget.
    /// The driver aborts the whole batch when any shard reports this.
    #[error("rally exceeded the step budget of {fuel} transitions")]
    BudgetExceeded { fuel: u32 },

    /// Cooperative cancel or deadline. Carries the number of rallies that
    /// finished before the stop; no aggregated probability is reported.
    #[error("simulation cancelled after {completed} completed rallies")]
    Cancelled { completed: u64 },

    /// Classifier training produced non-finite values or failed to converge.
    #[error("classifier training failed: {0}")]
    ModelFitFailure(String),

    /// The outcome column is near-constant. The partial report carries
    /// importances only; SHAP and marginal impacts are not computed.
    #[error("outcome classes nearly constant (positive rate {p_positive:.4})")]
    DegenerateOutcome {
        p_positive: f64,
        partial: Box<AttributionReport>,
    },

    /// Bug-class invariant violation; reproducible from the master seed.
    #[error("internal invariant violated: {0}")]
    InternalError(String),
}

impl SimError {
    pub fn invalid_stats(field: impl Into<String>, value: f64, message: impl Into<String>) -> Self {
        Self::InvalidStats {
            field: field.into(),
            value,
            message: message.into(),
        }
    }
}
