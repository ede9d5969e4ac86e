use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::driver::{self, ServeSchedule, SimOptions};
use crate::error::SimError;
use crate::team_stats::{self, FEATURES, TeamId, TeamStats};

/// Labeled training data for the attribution engine: one row per rally,
/// row-major, y = 1 when team A took the point.
#[derive(Debug, Clone)]
pub struct RallyDataset {
    pub feature_names: Vec<String>,
    pub n_features: usize,
    pub x: Vec<f64>,
    pub y: Vec<u8>,
}

impl RallyDataset {
    pub fn rows(&self) -> usize {
        self.y.len()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.x[index * self.n_features..(index + 1) * self.n_features]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PerturbConfig {
    /// Number of perturbed design points (R).
    pub design_points: usize,
    /// Rallies simulated per design point (M).
    pub rallies_per_point: u64,
    /// Half-width of the uniform additive noise.
    pub delta: f64,
    pub master_seed: u64,
    /// Attribution keeps the server fixed so points stay independent.
    pub serving: TeamId,
}

impl Default for PerturbConfig {
    fn default() -> Self {
        Self {
            design_points: 300,
            rallies_per_point: 1,
            delta: 0.05,
            master_seed: 0,
            serving: TeamId::A,
        }
    }
}

/// Generate the perturbed dataset: R design points, M rallies each, one row
/// per rally. A single master seed determines both the perturbations and
/// the rally draws.
pub fn generate_dataset(
    team_a: &TeamStats,
    team_b: &TeamStats,
    config: &PerturbConfig,
    options: &SimOptions,
) -> Result<RallyDataset, SimError> {
    team_a.validate("team_a")?;
    team_b.validate("team_b")?;
    if config.design_points == 0 || config.rallies_per_point == 0 {
        return Err(SimError::invalid_stats(
            "config.design_points",
            config.design_points as f64,
            "design points and rallies per point must be positive",
        ));
    }

    let feature_names = team_stats::feature_names();
    let n_features = feature_names.len();
    let rows = config.design_points * config.rallies_per_point as usize;
    let mut x = Vec::with_capacity(rows * n_features);
    let mut y = Vec::with_capacity(rows);

    for design_idx in 0..config.design_points {
        let mut noise_rng =
            ChaCha8Rng::seed_from_u64(splitmix(config.master_seed, 2 * design_idx as u64));
        let varied_a = perturb(team_a, config.delta, &mut noise_rng);
        let varied_b = perturb(team_b, config.delta, &mut noise_rng);

        let rally_seed = splitmix(config.master_seed, 2 * design_idx as u64 + 1);
        let result = driver::simulate(
            &varied_a,
            &varied_b,
            config.rallies_per_point,
            rally_seed,
            ServeSchedule::FixedServer(config.serving),
            options,
        )?;

        // One row per rally; rows within a design point share features, so
        // the win count expands into that many positive labels.
        let features = team_stats::feature_vector(&varied_a, &varied_b);
        for rally_idx in 0..config.rallies_per_point {
            x.extend_from_slice(&features);
            y.push(u8::from(rally_idx < result.wins_a));
        }
    }

    debug!(
        rows = y.len(),
        features = n_features,
        positives = y.iter().filter(|&&v| v == 1).count(),
        "perturbation dataset generated"
    );

    Ok(RallyDataset {
        feature_names,
        n_features,
        x,
        y,
    })
}

/// Uniform additive noise in ±delta per perturbable feature, then repair:
/// clamp to the feature range, rescale the serve pair if its mass tops 1,
/// and renormalize the reception row to sum 1.
fn perturb(stats: &TeamStats, delta: f64, rng: &mut impl Rng) -> TeamStats {
    let mut out = *stats;
    for spec in FEATURES {
        let Some(set) = spec.set else { continue };
        let noise = rng.random_range(-delta..=delta);
        let value = ((spec.get)(&out) + noise).clamp(spec.range.0, spec.range.1);
        set(&mut out, value);
    }

    let serve_mass = out.ace + out.serve_error;
    if serve_mass > 1.0 {
        out.ace /= serve_mass;
        out.serve_error /= serve_mass;
    }

    out.normalized()
}

fn splitmix(seed: u64, stream: u64) -> u64 {
    let mut z = seed.wrapping_add(stream.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_shape_matches_config() {
        let stats = TeamStats::default();
        let config = PerturbConfig {
            design_points: 40,
            rallies_per_point: 3,
            master_seed: 5,
            ..PerturbConfig::default()
        };
        let data = generate_dataset(&stats, &stats, &config, &SimOptions::default()).unwrap();

        assert_eq!(data.rows(), 120);
        assert_eq!(data.n_features, 28);
        assert_eq!(data.x.len(), 120 * 28);
        assert_eq!(data.feature_names.len(), 28);
        assert!(data.y.iter().all(|&v| v <= 1));
    }

    #[test]
    fn same_seed_reproduces_the_dataset() {
        let stats = TeamStats::default();
        let config = PerturbConfig {
            design_points: 25,
            master_seed: 123,
            ..PerturbConfig::default()
        };
        let first = generate_dataset(&stats, &stats, &config, &SimOptions::default()).unwrap();
        let second = generate_dataset(&stats, &stats, &config, &SimOptions::default()).unwrap();
        assert_eq!(first.x, second.x);
        assert_eq!(first.y, second.y);
    }

    #[test]
    fn perturbed_stats_stay_valid() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..200 {
            let varied = perturb(&TeamStats::default(), 0.05, &mut rng);
            varied.validate("varied").expect("perturbation preserves invariants");
            let reception =
                varied.perfect + varied.good + varied.poor + varied.reception_error;
            assert!((reception - 1.0).abs() < 1e-9);
            assert!(varied.ace + varied.serve_error <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn perturbation_moves_features() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let base = TeamStats::default();
        let varied = perturb(&base, 0.05, &mut rng);
        assert_ne!(base, varied);
        // Derived column tracks the perturbed parents.
        assert!(
            (varied.hitting_efficiency() - (varied.kill - varied.attack_error)).abs() < 1e-12
        );
    }
}
