use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conditional::ConditionalModel;
use crate::error::SimError;
use crate::metrics::{self, Z_95};
use crate::rally::{self, DEFAULT_FUEL};
use crate::team_stats::{TeamId, TeamStats};

/// Rallies per shard. The shard count depends only on N, so aggregated
/// counts are bit-identical for any worker count; the thread pool merely
/// bounds how many shards run at once.
pub const SHARD_SIZE: u64 = 1024;
/// Bootstrap resamples for the momentum CI.
pub const BOOTSTRAP_RESAMPLES: usize = 200;
/// Hard cap on any single momentum boost.
pub const MAX_MOMENTUM_BOOST: f64 = 0.05;

/// Who serves each rally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServeSchedule {
    /// One team serves every rally; keeps points independent. The
    /// attribution engine always uses this.
    FixedServer(TeamId),
    /// The loser of the previous rally serves the next one. The chain
    /// restarts at `first` at each shard boundary.
    LoserServes { first: TeamId },
}

/// Additive ace boost after k consecutive serve-points by the same team
/// (k = 1, 2, 3+). Each entry is clamped to [0, MAX_MOMENTUM_BOOST].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentumConfig {
    pub boosts: [f64; 3],
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            boosts: [0.01, 0.02, 0.03],
        }
    }
}

impl MomentumConfig {
    fn boost(&self, streak: u32) -> f64 {
        if streak == 0 {
            return 0.0;
        }
        let idx = (streak.min(3) - 1) as usize;
        self.boosts[idx].clamp(0.0, MAX_MOMENTUM_BOOST)
    }
}

/// Cooperative cancellation handle, checked at shard boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run-level options. `TeamStats` and the conditional model are read-only
/// and shared across shards; everything mutable is shard-owned.
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    pub conditional: ConditionalModel,
    pub momentum: Option<MomentumConfig>,
    pub cancel: Option<CancelToken>,
    pub deadline: Option<Duration>,
    pub fuel: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub n: u64,
    pub wins_a: u64,
    pub wins_b: u64,
    pub p_a_win: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub seed: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ShardCounts {
    wins_a: u64,
    rallies: u64,
}

/// Execute `n` independent rallies and aggregate win counts. Deterministic
/// for a given `(master_seed, n, stats, schedule)` regardless of worker
/// count: each fixed-size shard derives its own RNG from
/// `master_seed + shard_index` and results reduce by integer addition.
pub fn simulate(
    team_a: &TeamStats,
    team_b: &TeamStats,
    n: u64,
    master_seed: u64,
    schedule: ServeSchedule,
    options: &SimOptions,
) -> Result<SimulationResult, SimError> {
    team_a.validate("team_a")?;
    team_b.validate("team_b")?;
    options.conditional.validate()?;
    if n == 0 {
        return Err(SimError::invalid_stats("n", 0.0, "rally count must be positive"));
    }

    let team_a = team_a.normalized();
    let team_b = team_b.normalized();
    let fuel = options.fuel.unwrap_or(DEFAULT_FUEL);
    let start = Instant::now();
    let deadline = options.deadline.map(|d| start + d);
    let completed = AtomicU64::new(0);

    let shards = n.div_ceil(SHARD_SIZE);
    debug!(n, shards, seed = master_seed, "starting monte carlo batch");

    let shard_counts: Vec<ShardCounts> = (0..shards)
        .into_par_iter()
        .map(|shard_idx| {
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
                || deadline.is_some_and(|d| Instant::now() >= d)
            {
                return Err(SimError::Cancelled {
                    completed: completed.load(Ordering::Relaxed),
                });
            }

            let shard_n = SHARD_SIZE.min(n - shard_idx * SHARD_SIZE);
            let counts = run_shard(
                &team_a,
                &team_b,
                shard_n,
                master_seed.wrapping_add(shard_idx),
                schedule,
                options,
                fuel,
            )?;
            completed.fetch_add(shard_n, Ordering::Relaxed);
            Ok(counts)
        })
        .collect::<Result<_, _>>()?;

    let wins_a: u64 = shard_counts.iter().map(|s| s.wins_a).sum();
    let wins_b = n - wins_a;
    let p_a_win = wins_a as f64 / n as f64;

    let (ci_low, ci_high) = if options.momentum.is_some() {
        bootstrap_interval(&shard_counts, master_seed)
    } else {
        metrics::wilson_interval(wins_a, n, Z_95)
    };

    let elapsed = start.elapsed();
    // Debug level: the data generator runs thousands of small batches.
    debug!(
        n,
        wins_a,
        wins_b,
        p_a_win,
        elapsed_ms = elapsed.as_millis() as u64,
        "monte carlo batch complete"
    );

    Ok(SimulationResult {
        n,
        wins_a,
        wins_b,
        p_a_win,
        ci_low,
        ci_high,
        seed: master_seed,
        elapsed,
    })
}

fn run_shard(
    team_a: &TeamStats,
    team_b: &TeamStats,
    shard_n: u64,
    shard_seed: u64,
    schedule: ServeSchedule,
    options: &SimOptions,
    fuel: u32,
) -> Result<ShardCounts, SimError> {
    let mut rng = ChaCha8Rng::seed_from_u64(shard_seed);
    let mut server = match schedule {
        ServeSchedule::FixedServer(team) => team,
        ServeSchedule::LoserServes { first } => first,
    };
    let mut streak: u32 = 0;
    let mut wins_a = 0u64;

    for _ in 0..shard_n {
        let boost = options
            .momentum
            .map_or(0.0, |momentum| momentum.boost(streak));

        let outcome = rally::simulate_rally(
            team_a,
            team_b,
            server,
            &options.conditional,
            &mut rng,
            fuel,
            false,
            boost,
        )?;

        if outcome.winner == TeamId::A {
            wins_a += 1;
        }

        let server_won = outcome.winner == server;
        match schedule {
            ServeSchedule::FixedServer(_) => {
                streak = if server_won { streak + 1 } else { 0 };
            }
            ServeSchedule::LoserServes { .. } => {
                // A serve-point hands the serve away, so no streak survives.
                streak = 0;
                if server_won {
                    server = server.opponent();
                }
            }
        }
    }

    Ok(ShardCounts {
        wins_a,
        rallies: shard_n,
    })
}

/// Percentile bootstrap over per-shard win proportions. Shards are the
/// independent unit once momentum couples rallies within a shard.
fn bootstrap_interval(shards: &[ShardCounts], master_seed: u64) -> (f64, f64) {
    if shards.is_empty() {
        return (0.0, 1.0);
    }
    let mut rng = ChaCha8Rng::seed_from_u64(master_seed ^ 0x9e37_79b9_7f4a_7c15);
    let mut estimates = Vec::with_capacity(BOOTSTRAP_RESAMPLES);

    for _ in 0..BOOTSTRAP_RESAMPLES {
        let mut wins = 0u64;
        let mut total = 0u64;
        for _ in 0..shards.len() {
            let pick = shards[rng.random_range(0..shards.len())];
            wins += pick.wins_a;
            total += pick.rallies;
        }
        estimates.push(wins as f64 / total.max(1) as f64);
    }

    estimates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (
        metrics::percentile(&estimates, 0.025),
        metrics::percentile(&estimates, 0.975),
    )
}
