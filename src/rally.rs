use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::conditional::ConditionalModel;
use crate::error::SimError;
use crate::kernel::{self, Quality, RallyState};
use crate::team_stats::{TeamId, TeamStats};

/// Step budget per rally. Realistic inputs converge in under 30 steps; the
/// fuel only trips on pathological stats where no terminal mass remains.
pub const DEFAULT_FUEL: u32 = 256;

/// Mutable bookkeeping for one rally, discarded at rally end.
#[derive(Debug, Clone, Copy)]
pub struct RallyContext {
    pub serving: TeamId,
    pub possession: TeamId,
    pub quality_carry: Option<Quality>,
    pub contact_count: u16,
    pub prev_state: RallyState,
    /// Momentum adjustment for the current server; 0 unless enabled.
    pub ace_boost: f64,
}

impl RallyContext {
    pub fn new(serving: TeamId, ace_boost: f64) -> Self {
        Self {
            serving,
            possession: serving,
            quality_carry: None,
            contact_count: 0,
            prev_state: RallyState::ServeAttempt,
            ace_boost,
        }
    }
}

/// Outcome of a single simulated rally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RallyOutcome {
    pub winner: TeamId,
    pub serving: TeamId,
    pub contacts: u16,
    /// Recorded only on request; off in batch runs for throughput.
    pub trajectory: Option<Vec<RallyState>>,
}

/// Step one rally from serve to a terminal state using the caller's RNG.
/// Stats must already be validated and normalized.
pub fn simulate_rally(
    team_a: &TeamStats,
    team_b: &TeamStats,
    serving: TeamId,
    model: &ConditionalModel,
    rng: &mut impl Rng,
    fuel: u32,
    record_trajectory: bool,
    ace_boost: f64,
) -> Result<RallyOutcome, SimError> {
    let mut ctx = RallyContext::new(serving, ace_boost);
    let mut state = RallyState::ServeAttempt;
    let mut trajectory = record_trajectory.then(|| vec![state]);

    for _ in 0..fuel {
        let dist = kernel::transition(
            state,
            ctx.serving,
            ctx.possession,
            ctx.ace_boost,
            team_a,
            team_b,
            model,
        )?;
        let next = sample(&dist, rng)?;

        match next {
            RallyState::ServeInPlay => {
                ctx.possession = ctx.serving.opponent();
                ctx.contact_count += 1;
            }
            RallyState::Reception(q) => {
                ctx.quality_carry = Some(q);
                ctx.contact_count += 1;
            }
            RallyState::Set(q) => {
                ctx.quality_carry = Some(q);
                ctx.contact_count += 1;
            }
            RallyState::AttackDefended => {
                ctx.possession = ctx.possession.opponent();
                ctx.contact_count += 1;
            }
            RallyState::PointFor(winner) => {
                if let Some(t) = &mut trajectory {
                    t.push(next);
                }
                return Ok(RallyOutcome {
                    winner,
                    serving,
                    contacts: ctx.contact_count,
                    trajectory,
                });
            }
            RallyState::ServeAttempt => {
                return Err(SimError::InternalError(
                    "kernel produced a transition back into ServeAttempt".into(),
                ));
            }
        }

        ctx.prev_state = state;
        state = next;
        if let Some(t) = &mut trajectory {
            t.push(state);
        }
    }

    Err(SimError::BudgetExceeded { fuel })
}

/// Simulate one rally with a fresh seeded RNG and a full trajectory; the
/// test-and-debug entry point.
pub fn single_rally(
    team_a: &TeamStats,
    team_b: &TeamStats,
    serving: TeamId,
    seed: u64,
) -> Result<RallyOutcome, SimError> {
    team_a.validate("team_a")?;
    team_b.validate("team_b")?;
    let model = ConditionalModel::default();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    simulate_rally(
        &team_a.normalized(),
        &team_b.normalized(),
        serving,
        &model,
        &mut rng,
        DEFAULT_FUEL,
        true,
        0.0,
    )
}

fn sample(dist: &kernel::Transition, rng: &mut impl Rng) -> Result<RallyState, SimError> {
    let draw: f64 = rng.random();
    let mut cumulative = 0.0;
    for (state, p) in dist {
        cumulative += p;
        if draw < cumulative {
            return Ok(*state);
        }
    }
    // Float tail: the draw landed within rounding of the total mass.
    dist.last()
        .map(|(state, _)| *state)
        .ok_or_else(|| SimError::InternalError("kernel produced an empty distribution".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rally_terminates_with_trajectory() {
        let stats = TeamStats::default();
        let outcome = single_rally(&stats, &stats, TeamId::A, 42).unwrap();

        let trajectory = outcome.trajectory.expect("trajectory requested");
        assert_eq!(trajectory[0], RallyState::ServeAttempt);
        assert!(trajectory.last().unwrap().is_terminal());
        assert!(trajectory.len() <= DEFAULT_FUEL as usize + 1);
        assert_eq!(outcome.serving, TeamId::A);
    }

    #[test]
    fn same_seed_same_rally() {
        let stats = TeamStats::default();
        let first = single_rally(&stats, &stats, TeamId::B, 7).unwrap();
        let second = single_rally(&stats, &stats, TeamId::B, 7).unwrap();
        assert_eq!(first.winner, second.winner);
        assert_eq!(first.contacts, second.contacts);
        assert_eq!(first.trajectory, second.trajectory);
    }

    #[test]
    fn pure_ace_server_always_wins() {
        let server = TeamStats {
            ace: 1.0,
            serve_error: 0.0,
            ..TeamStats::default()
        };
        let receiver = TeamStats::default();
        for seed in 0..20 {
            let outcome = single_rally(&server, &receiver, TeamId::A, seed).unwrap();
            assert_eq!(outcome.winner, TeamId::A);
            assert_eq!(outcome.contacts, 0);
        }
    }

    #[test]
    fn endless_cycle_exhausts_fuel() {
        // No terminal mass anywhere: serve always lands, reception never
        // errs, sets never err, attacks never terminate, defense always
        // controls the ball.
        let looper = TeamStats {
            ace: 0.0,
            serve_error: 0.0,
            perfect: 0.40,
            good: 0.40,
            poor: 0.20,
            reception_error: 0.0,
            ball_handling_error: 0.0,
            kill: 0.0,
            attack_error: 0.0,
            dig: 1.0,
            block_kill: 0.0,
            controlled_block: 1.0,
            block_error: 0.0,
        };
        let err = single_rally(&looper, &looper, TeamId::A, 3).unwrap_err();
        assert!(matches!(err, SimError::BudgetExceeded { fuel: DEFAULT_FUEL }));
    }

    #[test]
    fn invalid_input_is_rejected_before_simulation() {
        let bad = TeamStats {
            kill: 1.7,
            ..TeamStats::default()
        };
        let err = single_rally(&bad, &TeamStats::default(), TeamId::A, 1).unwrap_err();
        assert!(matches!(err, SimError::InvalidStats { .. }));
    }
}
