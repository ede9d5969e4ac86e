use serde::{Deserialize, Serialize};

use crate::conditional::ConditionalModel;
use crate::error::SimError;
use crate::team_stats::{TeamId, TeamStats};

/// Pre-normalization mass must already be this close to 1; anything further
/// off means the inputs are inconsistent, not merely drifted.
pub const MASS_TOLERANCE: f64 = 1e-6;
/// Post-normalization distributions sum to 1 within this bound.
pub const NORMALIZED_TOLERANCE: f64 = 1e-9;

/// Ordinal contact quality used as the lookup key into conditional rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    Perfect,
    Good,
    Poor,
}

impl Quality {
    pub fn index(self) -> usize {
        match self {
            Quality::Perfect => 0,
            Quality::Good => 1,
            Quality::Poor => 2,
        }
    }
}

/// Closed set of rally states. Intermediate outcomes with no onward play
/// (aces, kills, faults) collapse directly into `PointFor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RallyState {
    ServeAttempt,
    ServeInPlay,
    Reception(Quality),
    Set(Quality),
    AttackDefended,
    PointFor(TeamId),
}

impl RallyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RallyState::PointFor(_))
    }
}

/// Distribution over next states for one transition. Entries are emitted in
/// a fixed role-relative order (possession-side outcomes before opponent
/// outcomes, continuations last) so that relabeling the two teams maps
/// sampled trajectories one-to-one; the swap symmetry of the driver depends
/// on this.
pub type Transition = Vec<(RallyState, f64)>;

/// Compute the outgoing distribution for `state`. Pure: no RNG, no shared
/// state. `possession` is the team preparing the ball; during serve states
/// that is the serving team. `ace_boost` is the momentum adjustment for the
/// current server (0 when the extension is off).
pub fn transition(
    state: RallyState,
    serving: TeamId,
    possession: TeamId,
    ace_boost: f64,
    team_a: &TeamStats,
    team_b: &TeamStats,
    model: &ConditionalModel,
) -> Result<Transition, SimError> {
    let stats = |team: TeamId| match team {
        TeamId::A => team_a,
        TeamId::B => team_b,
    };

    let raw: Transition = match state {
        RallyState::ServeAttempt => {
            let server = stats(serving);
            let receiver = serving.opponent();
            // The boost may not push total serve mass past 1.
            let ace = (server.ace + ace_boost.max(0.0))
                .min(1.0 - server.serve_error)
                .max(0.0);
            vec![
                (RallyState::PointFor(serving), ace),
                (RallyState::PointFor(receiver), server.serve_error),
                (RallyState::ServeInPlay, 1.0 - ace - server.serve_error),
            ]
        }

        RallyState::ServeInPlay => {
            let receiver = serving.opponent();
            let r = stats(receiver);
            vec![
                (RallyState::Reception(Quality::Perfect), r.perfect),
                (RallyState::Reception(Quality::Good), r.good),
                (RallyState::Reception(Quality::Poor), r.poor),
                (RallyState::PointFor(serving), r.reception_error),
            ]
        }

        RallyState::Reception(quality) => {
            let p = stats(possession);
            let bhe = p.ball_handling_error;
            let row = model.set_given_reception[quality.index()];
            let keep = 1.0 - bhe;
            vec![
                // Setter fault: point to the non-possession team.
                (RallyState::PointFor(possession.opponent()), bhe),
                (RallyState::Set(Quality::Perfect), row[0] * keep),
                (RallyState::Set(Quality::Good), row[1] * keep),
                (RallyState::Set(Quality::Poor), row[2] * keep),
            ]
        }

        RallyState::Set(quality) => {
            let p = stats(possession);
            let (kill, error) = anchored_attack(p, model, quality);
            vec![
                (RallyState::PointFor(possession), kill),
                (RallyState::PointFor(possession.opponent()), error),
                (RallyState::AttackDefended, 1.0 - kill - error),
            ]
        }

        RallyState::AttackDefended => {
            // Possession has already switched: `possession` is the defender.
            let defender = possession;
            let attacker = possession.opponent();
            let d = stats(defender);
            let (w_block, w_dig) = model.branch_weights();

            // Each branch is a distribution of its own before blending.
            let block_mass = d.block_kill + d.controlled_block + d.block_error;
            let (block, w_block, w_dig) = if block_mass > 0.0 {
                (
                    [
                        d.block_kill / block_mass,
                        d.controlled_block / block_mass,
                        d.block_error / block_mass,
                    ],
                    w_block,
                    w_dig,
                )
            } else {
                // No blocking game at all: the dig branch carries everything.
                ([0.0; 3], 0.0, 1.0)
            };
            let total = w_block + w_dig;
            let (w_block, w_dig) = (w_block / total, w_dig / total);

            vec![
                (RallyState::PointFor(defender), w_block * block[0]),
                (
                    RallyState::Reception(Quality::Good),
                    w_block * block[1] + w_dig * d.dig,
                ),
                (
                    RallyState::PointFor(attacker),
                    w_block * block[2] + w_dig * (1.0 - d.dig),
                ),
            ]
        }

        RallyState::PointFor(winner) => {
            return Err(SimError::InternalError(format!(
                "transition requested from terminal state PointFor({winner:?})"
            )));
        }
    };

    normalize(raw, state)
}

/// Effective (kill, error) for a set quality. The conditional rows act as a
/// relative profile anchored at the Perfect row; the team's own rates set
/// the absolute level. A zero anchor falls back to the row verbatim.
fn anchored_attack(stats: &TeamStats, model: &ConditionalModel, quality: Quality) -> (f64, f64) {
    let anchor = model.attack_given_set[0];
    let row = model.attack_given_set[quality.index()];

    let mut kill = if anchor.kill > f64::EPSILON {
        stats.kill * row.kill / anchor.kill
    } else {
        row.kill
    };
    let mut error = if anchor.error > f64::EPSILON {
        stats.attack_error * row.error / anchor.error
    } else {
        row.error
    };

    kill = kill.clamp(0.0, 1.0);
    error = error.clamp(0.0, 1.0);
    let mass = kill + error;
    if mass > 1.0 {
        kill /= mass;
        error /= mass;
    }
    (kill, error)
}

fn normalize(mut dist: Transition, state: RallyState) -> Result<Transition, SimError> {
    let mass: f64 = dist.iter().map(|(_, p)| p).sum();
    if !mass.is_finite() || (mass - 1.0).abs() > MASS_TOLERANCE {
        return Err(SimError::invalid_stats(
            format!("kernel.{state:?}"),
            mass,
            "transition mass must sum to 1 before normalization",
        ));
    }
    for (_, p) in &mut dist {
        *p /= mass;
    }
    dist.retain(|(_, p)| *p > 0.0);
    Ok(dist)
}
