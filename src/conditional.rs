use serde::{Deserialize, Serialize};

use crate::error::SimError;

pub const ROW_SUM_TOLERANCE: f64 = 1e-6;

/// Relative attack profile for one set quality. The kernel anchors these at
/// the Perfect row and scales by the attacking team's own kill/error rates,
/// so a custom table reshapes the quality gradient without overriding the
/// team level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttackRow {
    pub kill: f64,
    pub error: f64,
}

/// Fixed conditional lookup: P(set quality | reception quality) and the
/// attack profile per set quality, plus the block/dig blend of the defended
/// attack state. Rows are indexed Perfect, Good, Poor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionalModel {
    pub set_given_reception: [[f64; 3]; 3],
    pub attack_given_set: [AttackRow; 3],
    /// Weight of the block branch when an attack is defended. Free parameter;
    /// normalized against `w_dig` at use.
    pub w_block: f64,
    pub w_dig: f64,
}

impl Default for ConditionalModel {
    fn default() -> Self {
        Self {
            set_given_reception: [
                [0.90, 0.08, 0.02],
                [0.60, 0.35, 0.05],
                [0.20, 0.60, 0.20],
            ],
            attack_given_set: [
                AttackRow { kill: 0.60, error: 0.15 },
                AttackRow { kill: 0.40, error: 0.20 },
                AttackRow { kill: 0.20, error: 0.35 },
            ],
            w_block: 0.4,
            w_dig: 0.6,
        }
    }
}

impl ConditionalModel {
    pub fn validate(&self) -> Result<(), SimError> {
        for (i, row) in self.set_given_reception.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(SimError::invalid_stats(
                    format!("conditional.set_given_reception[{i}]"),
                    sum,
                    "row must sum to 1",
                ));
            }
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(SimError::invalid_stats(
                    format!("conditional.set_given_reception[{i}]"),
                    f64::NAN,
                    "row entries must be non-negative",
                ));
            }
        }

        for (i, row) in self.attack_given_set.iter().enumerate() {
            if !(0.0..=1.0).contains(&row.kill) || !(0.0..=1.0).contains(&row.error) {
                return Err(SimError::invalid_stats(
                    format!("conditional.attack_given_set[{i}]"),
                    row.kill,
                    "kill and error must lie in [0, 1]",
                ));
            }
            if row.kill + row.error > 1.0 + ROW_SUM_TOLERANCE {
                return Err(SimError::invalid_stats(
                    format!("conditional.attack_given_set[{i}]"),
                    row.kill + row.error,
                    "kill + error must not exceed 1",
                ));
            }
        }

        if self.w_block < 0.0 || self.w_dig < 0.0 || self.w_block + self.w_dig <= 0.0 {
            return Err(SimError::invalid_stats(
                "conditional.w_block",
                self.w_block,
                "branch weights must be non-negative with a positive sum",
            ));
        }

        Ok(())
    }

    /// Branch weights normalized to a distribution.
    pub fn branch_weights(&self) -> (f64, f64) {
        let sum = self.w_block + self.w_dig;
        (self.w_block / sum, self.w_dig / sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_validates() {
        ConditionalModel::default().validate().expect("defaults are valid");
    }

    #[test]
    fn bad_set_row_is_rejected() {
        let mut model = ConditionalModel::default();
        model.set_given_reception[1] = [0.5, 0.4, 0.2];
        assert!(model.validate().is_err());
    }

    #[test]
    fn attack_row_mass_checked() {
        let mut model = ConditionalModel::default();
        model.attack_given_set[0] = AttackRow { kill: 0.8, error: 0.4 };
        assert!(model.validate().is_err());
    }

    #[test]
    fn branch_weights_normalize() {
        let model = ConditionalModel {
            w_block: 1.0,
            w_dig: 3.0,
            ..ConditionalModel::default()
        };
        let (wb, wd) = model.branch_weights();
        assert!((wb - 0.25).abs() < 1e-12);
        assert!((wd - 0.75).abs() < 1e-12);
    }
}
