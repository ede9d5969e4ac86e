use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Reception rows may drift slightly when entered from scouting sheets.
pub const RECEPTION_SUM_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamId {
    A,
    B,
}

impl TeamId {
    pub fn opponent(self) -> TeamId {
        match self {
            TeamId::A => TeamId::B,
            TeamId::B => TeamId::A,
        }
    }
}

/// Skill-group taxonomy used to tag features in attribution output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureCategory {
    Serve,
    Reception,
    Setting,
    Attack,
    Defense,
    Blocking,
}

/// Per-team performance profile. All rates are fractions in [0, 1] and the
/// record is treated as read-only once validated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamStats {
    pub ace: f64,
    pub serve_error: f64,
    pub perfect: f64,
    pub good: f64,
    pub poor: f64,
    pub reception_error: f64,
    pub ball_handling_error: f64,
    pub kill: f64,
    pub attack_error: f64,
    pub dig: f64,
    pub block_kill: f64,
    pub controlled_block: f64,
    pub block_error: f64,
}

impl Default for TeamStats {
    fn default() -> Self {
        Self {
            ace: 0.10,
            serve_error: 0.05,
            perfect: 0.30,
            good: 0.50,
            poor: 0.15,
            reception_error: 0.05,
            ball_handling_error: 0.02,
            kill: 0.45,
            attack_error: 0.10,
            dig: 0.60,
            block_kill: 0.15,
            controlled_block: 0.25,
            block_error: 0.05,
        }
    }
}

impl TeamStats {
    /// Derived, never stored: recomputed so perturbed stats stay consistent.
    pub fn hitting_efficiency(&self) -> f64 {
        self.kill - self.attack_error
    }

    /// Copy with the reception row rescaled to sum to exactly 1. Validation
    /// tolerates a ±0.005 drift; the kernel's mass check does not, so entry
    /// points normalize validated stats before simulating.
    pub fn normalized(&self) -> TeamStats {
        let mut out = *self;
        let sum = self.perfect + self.good + self.poor + self.reception_error;
        if sum > 0.0 {
            out.perfect /= sum;
            out.good /= sum;
            out.poor /= sum;
            out.reception_error /= sum;
        }
        out
    }

    /// Fail-fast range and sum checks. `label` names the team in error
    /// messages (e.g. `team_a`).
    pub fn validate(&self, label: &str) -> Result<(), SimError> {
        for spec in FEATURES {
            if spec.derived {
                continue;
            }
            let value = (spec.get)(self);
            if !value.is_finite() || value < spec.range.0 || value > spec.range.1 {
                return Err(SimError::invalid_stats(
                    format!("{label}.{}", spec.name),
                    value,
                    format!("must lie in [{}, {}]", spec.range.0, spec.range.1),
                ));
            }
        }

        let serve_mass = self.ace + self.serve_error;
        if serve_mass > 1.0 + f64::EPSILON {
            return Err(SimError::invalid_stats(
                format!("{label}.ace"),
                serve_mass,
                "ace + serve_error must not exceed 1",
            ));
        }

        let reception_sum = self.perfect + self.good + self.poor + self.reception_error;
        if (reception_sum - 1.0).abs() > RECEPTION_SUM_TOLERANCE {
            return Err(SimError::invalid_stats(
                format!("{label}.perfect"),
                reception_sum,
                "reception distribution must sum to 1",
            ));
        }

        Ok(())
    }
}

/// One row of the explicit feature table. Perturbation, importance ranking
/// and SHAP all iterate this table; there is no string-keyed field access in
/// hot paths.
pub struct FeatureSpec {
    pub name: &'static str,
    pub category: FeatureCategory,
    pub range: (f64, f64),
    /// Derived features are read for model input but never perturbed.
    pub derived: bool,
    pub get: fn(&TeamStats) -> f64,
    pub set: Option<fn(&mut TeamStats, f64)>,
}

pub const FEATURES: &[FeatureSpec] = &[
    FeatureSpec {
        name: "ace",
        category: FeatureCategory::Serve,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.ace,
        set: Some(|s, v| s.ace = v),
    },
    FeatureSpec {
        name: "serve_error",
        category: FeatureCategory::Serve,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.serve_error,
        set: Some(|s, v| s.serve_error = v),
    },
    FeatureSpec {
        name: "perfect",
        category: FeatureCategory::Reception,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.perfect,
        set: Some(|s, v| s.perfect = v),
    },
    FeatureSpec {
        name: "good",
        category: FeatureCategory::Reception,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.good,
        set: Some(|s, v| s.good = v),
    },
    FeatureSpec {
        name: "poor",
        category: FeatureCategory::Reception,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.poor,
        set: Some(|s, v| s.poor = v),
    },
    FeatureSpec {
        name: "reception_error",
        category: FeatureCategory::Reception,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.reception_error,
        set: Some(|s, v| s.reception_error = v),
    },
    FeatureSpec {
        name: "ball_handling_error",
        category: FeatureCategory::Setting,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.ball_handling_error,
        set: Some(|s, v| s.ball_handling_error = v),
    },
    FeatureSpec {
        name: "kill",
        category: FeatureCategory::Attack,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.kill,
        set: Some(|s, v| s.kill = v),
    },
    FeatureSpec {
        name: "attack_error",
        category: FeatureCategory::Attack,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.attack_error,
        set: Some(|s, v| s.attack_error = v),
    },
    FeatureSpec {
        name: "hitting_efficiency",
        category: FeatureCategory::Attack,
        range: (-1.0, 1.0),
        derived: true,
        get: TeamStats::hitting_efficiency,
        set: None,
    },
    FeatureSpec {
        name: "dig",
        category: FeatureCategory::Defense,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.dig,
        set: Some(|s, v| s.dig = v),
    },
    FeatureSpec {
        name: "block_kill",
        category: FeatureCategory::Blocking,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.block_kill,
        set: Some(|s, v| s.block_kill = v),
    },
    FeatureSpec {
        name: "controlled_block",
        category: FeatureCategory::Blocking,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.controlled_block,
        set: Some(|s, v| s.controlled_block = v),
    },
    FeatureSpec {
        name: "block_error",
        category: FeatureCategory::Blocking,
        range: (0.0, 1.0),
        derived: false,
        get: |s| s.block_error,
        set: Some(|s, v| s.block_error = v),
    },
];

/// Full feature-name list for a two-team row: A's features then B's, in
/// table order, prefixed `a_` / `b_`.
pub fn feature_names() -> Vec<String> {
    let mut names = Vec::with_capacity(FEATURES.len() * 2);
    for prefix in ["a", "b"] {
        for spec in FEATURES {
            names.push(format!("{prefix}_{}", spec.name));
        }
    }
    names
}

/// Model-input row for a pair of team profiles, aligned with
/// [`feature_names`].
pub fn feature_vector(team_a: &TeamStats, team_b: &TeamStats) -> Vec<f64> {
    let mut row = Vec::with_capacity(FEATURES.len() * 2);
    for stats in [team_a, team_b] {
        for spec in FEATURES {
            row.push((spec.get)(stats));
        }
    }
    row
}

pub fn category_of(feature_index: usize) -> FeatureCategory {
    FEATURES[feature_index % FEATURES.len()].category
}
