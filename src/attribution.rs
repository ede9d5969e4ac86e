use std::fs;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{self, PerturbConfig, RallyDataset};
use crate::driver::SimOptions;
use crate::error::SimError;
use crate::gbt::{self, GbtModel};
use crate::logistic::{self, LogisticModel};
use crate::metrics;
use crate::team_stats::{self, FeatureCategory, TeamId, TeamStats};

/// Outcome share beyond which the label column is considered constant.
pub const DEGENERATE_IMBALANCE: f64 = 0.98;
/// Per-sample SHAP values are retained for at most this many holdout rows.
pub const SHAP_SAMPLE_CAP: usize = 200;

/// Closed model set; the engine dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Gbt,
    Logistic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    pub r_design_points: usize,
    pub m_rallies_per_point: u64,
    /// Perturbation half-width for the design points.
    pub delta: f64,
    pub model: ModelKind,
    pub holdout_fraction: f64,
    pub master_seed: u64,
    /// Shift used for the per-feature marginal-impact probe.
    pub feature_shift_delta: f64,
    /// Opt-in trained-model cache directory, keyed by a content hash of the
    /// config and both team profiles.
    #[serde(skip)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            r_design_points: 300,
            m_rallies_per_point: 1,
            delta: 0.05,
            model: ModelKind::Gbt,
            holdout_fraction: 0.2,
            master_seed: 0,
            feature_shift_delta: 0.05,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub accuracy: f64,
    pub auc: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub score: f32,
    pub marginal_impact_per_unit: f32,
    pub marginal_impact_relative: f32,
    pub rank: u16,
    pub category: FeatureCategory,
}

/// Global SHAP ranking entry (mean |phi| over the reference samples).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapValue {
    pub feature: String,
    pub mean_abs: f64,
}

/// Per-sample additive attribution in log-odds space. `values` follows
/// `feature_names` order and sums with the report's base value to `margin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapSample {
    pub margin: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionReport {
    pub feature_names: Vec<String>,
    pub importances: Vec<FeatureImportance>,
    pub shap: Vec<ShapValue>,
    pub shap_base_value: f64,
    pub shap_samples: Vec<ShapSample>,
    pub model_metrics: ModelMetrics,
    pub n_samples: usize,
    pub model: ModelKind,
    pub degenerate: bool,
    pub generated_at: String,
}

/// Trained classifier, serializable for the opt-in cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum TrainedModel {
    Gbt(GbtModel),
    Logistic(LogisticModel),
}

impl TrainedModel {
    fn predict_proba(&self, row: &[f64]) -> f64 {
        match self {
            TrainedModel::Gbt(m) => m.predict_proba(row),
            TrainedModel::Logistic(m) => m.predict_proba(row),
        }
    }

    fn margin(&self, row: &[f64]) -> f64 {
        match self {
            TrainedModel::Gbt(m) => m.margin(row),
            TrainedModel::Logistic(m) => m.margin(row),
        }
    }

    fn importance_scores(&self) -> Vec<f64> {
        match self {
            TrainedModel::Gbt(m) => m.importance_scores(),
            TrainedModel::Logistic(m) => m.importance_scores(),
        }
    }

    fn base_value(&self) -> f64 {
        match self {
            TrainedModel::Gbt(m) => m.base_value(),
            TrainedModel::Logistic(m) => m.base_value(),
        }
    }

    fn shap(&self, row: &[f64]) -> Vec<f64> {
        match self {
            TrainedModel::Gbt(m) => m.shap(row),
            TrainedModel::Logistic(m) => m.shap(row),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ModelArtifact {
    generated_at: String,
    n_samples: usize,
    model: TrainedModel,
}

/// Full sensitivity analysis: perturbed dataset, classifier fit, ranked
/// importances, marginal impacts, and SHAP attribution.
pub fn attribute(
    team_a: &TeamStats,
    team_b: &TeamStats,
    config: &AttributionConfig,
) -> Result<AttributionReport, SimError> {
    team_a.validate("team_a")?;
    team_b.validate("team_b")?;
    if !(0.05..=0.5).contains(&config.holdout_fraction) {
        return Err(SimError::invalid_stats(
            "config.holdout_fraction",
            config.holdout_fraction,
            "holdout fraction must lie in [0.05, 0.5]",
        ));
    }

    info!(
        r = config.r_design_points,
        m = config.m_rallies_per_point,
        model = ?config.model,
        seed = config.master_seed,
        "starting attribution analysis"
    );

    let perturb = PerturbConfig {
        design_points: config.r_design_points,
        rallies_per_point: config.m_rallies_per_point,
        delta: config.delta,
        master_seed: config.master_seed,
        serving: TeamId::A,
    };
    let data = dataset::generate_dataset(team_a, team_b, &perturb, &SimOptions::default())?;

    let positives = data.y.iter().filter(|&&v| v == 1).count();
    let p_positive = positives as f64 / data.rows() as f64;
    let degenerate = !(1.0 - DEGENERATE_IMBALANCE..=DEGENERATE_IMBALANCE).contains(&p_positive);

    let (train_idx, holdout_idx) =
        stratified_split(&data.y, config.holdout_fraction, config.master_seed);
    if train_idx.is_empty() || holdout_idx.is_empty() {
        return Err(SimError::ModelFitFailure(
            "train/holdout split produced an empty side".into(),
        ));
    }

    let train_rows: Vec<&[f64]> = train_idx.iter().map(|&i| data.row(i)).collect();
    let train_y: Vec<u8> = train_idx.iter().map(|&i| data.y[i]).collect();
    let holdout_rows: Vec<&[f64]> = holdout_idx.iter().map(|&i| data.row(i)).collect();
    let holdout_y: Vec<u8> = holdout_idx.iter().map(|&i| data.y[i]).collect();

    let cache_key = config
        .cache_dir
        .as_deref()
        .map(|dir| (dir.to_path_buf(), model_cache_key(config, team_a, team_b)));
    let cached = cache_key
        .as_ref()
        .and_then(|(dir, key)| load_cached_model(dir, *key));

    let model = match cached {
        Some(model) => model,
        None => {
            let model = match config.model {
                ModelKind::Gbt => TrainedModel::Gbt(gbt::fit(
                    &train_rows,
                    &train_y,
                    &holdout_rows,
                    &holdout_y,
                    data.n_features,
                )?),
                ModelKind::Logistic => {
                    TrainedModel::Logistic(logistic::cv_fit(&train_rows, &train_y)?)
                }
            };
            if let Some((dir, key)) = &cache_key {
                save_cached_model(dir, *key, &model, data.rows());
            }
            model
        }
    };

    let holdout_probs: Vec<f64> = holdout_rows.iter().map(|row| model.predict_proba(row)).collect();
    let holdout_metrics = metrics::evaluate_binary(&holdout_probs, &holdout_y);

    let scores = model.importance_scores();
    let (marginal_abs, marginal_rel) = if degenerate {
        (vec![0.0; data.n_features], vec![0.0; data.n_features])
    } else {
        marginal_impacts(&model, &holdout_rows, &holdout_probs, config.feature_shift_delta)
    };

    let importances = rank_importances(&data.feature_names, &scores, &marginal_abs, &marginal_rel);

    let (shap, shap_samples, shap_base_value) = if degenerate {
        (Vec::new(), Vec::new(), 0.0)
    } else {
        shap_summary(&model, &holdout_rows, &data.feature_names)
    };

    let report = AttributionReport {
        feature_names: data.feature_names.clone(),
        importances,
        shap,
        shap_base_value,
        shap_samples,
        model_metrics: ModelMetrics {
            accuracy: holdout_metrics.accuracy,
            auc: holdout_metrics.auc,
        },
        n_samples: data.rows(),
        model: config.model,
        degenerate,
        generated_at: chrono::Utc::now().to_rfc3339(),
    };

    info!(
        n_samples = report.n_samples,
        accuracy = report.model_metrics.accuracy,
        auc = report.model_metrics.auc,
        degenerate,
        "attribution analysis complete"
    );

    if degenerate {
        return Err(SimError::DegenerateOutcome {
            p_positive,
            partial: Box::new(report),
        });
    }
    Ok(report)
}

/// Deterministic stratified split: classes are shuffled separately by seed,
/// then each donates its trailing fraction to the holdout.
fn stratified_split(y: &[u8], holdout_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5eed_5eed_5eed_5eed);
    let mut train = Vec::new();
    let mut holdout = Vec::new();

    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
        if members.is_empty() {
            continue;
        }
        members.shuffle(&mut rng);
        let n_holdout = ((members.len() as f64 * holdout_fraction).round() as usize)
            .clamp(usize::from(members.len() > 1), members.len().saturating_sub(1));
        let split = members.len() - n_holdout;
        train.extend_from_slice(&members[..split]);
        holdout.extend_from_slice(&members[split..]);
    }

    train.sort_unstable();
    holdout.sort_unstable();
    (train, holdout)
}

/// Mean predicted P(A wins) over the holdout at baseline vs. with one
/// feature shifted by +delta (clamped to its range), all others held at
/// observed values.
fn marginal_impacts(
    model: &TrainedModel,
    holdout_rows: &[&[f64]],
    baseline_probs: &[f64],
    shift_delta: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n_features = holdout_rows.first().map_or(0, |r| r.len());
    let baseline_mean =
        baseline_probs.iter().sum::<f64>() / baseline_probs.len().max(1) as f64;

    let mut per_unit = vec![0.0; n_features];
    let mut relative = vec![0.0; n_features];
    let mut shifted = Vec::new();

    for feature in 0..n_features {
        let range = team_stats::FEATURES[feature % team_stats::FEATURES.len()].range;
        let mut sum = 0.0;
        for row in holdout_rows {
            shifted.clear();
            shifted.extend_from_slice(row);
            shifted[feature] = (shifted[feature] + shift_delta).clamp(range.0, range.1);
            sum += model.predict_proba(&shifted);
        }
        let shifted_mean = sum / holdout_rows.len().max(1) as f64;
        per_unit[feature] = (shifted_mean - baseline_mean) / shift_delta;
        relative[feature] = if baseline_mean.abs() > 1e-12 {
            (shifted_mean - baseline_mean) / baseline_mean
        } else {
            0.0
        };
    }
    (per_unit, relative)
}

/// Importances ranked by descending score, ties broken lexicographically by
/// feature name for stable output.
fn rank_importances(
    names: &[String],
    scores: &[f64],
    marginal_abs: &[f64],
    marginal_rel: &[f64],
) -> Vec<FeatureImportance> {
    // Ranking operates on the reported (f32) precision so that ties in the
    // output are exactly the ties the ordering rule saw.
    let reported: Vec<f32> = scores.iter().map(|&s| s as f32).collect();
    let mut order: Vec<usize> = (0..names.len()).collect();
    order.sort_by(|&i, &j| {
        reported[j]
            .partial_cmp(&reported[i])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| names[i].cmp(&names[j]))
    });

    order
        .into_iter()
        .enumerate()
        .map(|(rank, idx)| FeatureImportance {
            feature: names[idx].clone(),
            score: scores[idx] as f32,
            marginal_impact_per_unit: marginal_abs[idx] as f32,
            marginal_impact_relative: marginal_rel[idx] as f32,
            rank: rank as u16,
            category: team_stats::category_of(idx),
        })
        .collect()
}

fn shap_summary(
    model: &TrainedModel,
    holdout_rows: &[&[f64]],
    names: &[String],
) -> (Vec<ShapValue>, Vec<ShapSample>, f64) {
    let sample_rows = &holdout_rows[..holdout_rows.len().min(SHAP_SAMPLE_CAP)];
    let mut mean_abs = vec![0.0; names.len()];
    let mut samples = Vec::with_capacity(sample_rows.len());

    for row in sample_rows {
        let values = model.shap(row);
        for (acc, v) in mean_abs.iter_mut().zip(&values) {
            *acc += v.abs();
        }
        samples.push(ShapSample {
            margin: model.margin(row),
            values,
        });
    }
    for acc in &mut mean_abs {
        *acc /= sample_rows.len().max(1) as f64;
    }

    let mut ranking: Vec<ShapValue> = names
        .iter()
        .zip(&mean_abs)
        .map(|(name, &value)| ShapValue {
            feature: name.clone(),
            mean_abs: value,
        })
        .collect();
    ranking.sort_by(|a, b| {
        b.mean_abs
            .partial_cmp(&a.mean_abs)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.feature.cmp(&b.feature))
    });

    (ranking, samples, model.base_value())
}

fn model_cache_key(config: &AttributionConfig, team_a: &TeamStats, team_b: &TeamStats) -> u64 {
    let payload = serde_json::to_vec(&(config, team_a, team_b)).unwrap_or_default();
    fxhash::hash64(&payload)
}

fn cache_path(dir: &Path, key: u64) -> PathBuf {
    dir.join(format!("bvsim_model_{key:016x}.json"))
}

fn load_cached_model(dir: &Path, key: u64) -> Option<TrainedModel> {
    let path = cache_path(dir, key);
    let raw = fs::read_to_string(&path).ok()?;
    let artifact = serde_json::from_str::<ModelArtifact>(&raw).ok()?;
    debug!(path = %path.display(), "loaded cached attribution model");
    Some(artifact.model)
}

/// Cache writes are best-effort; a failed write never fails the analysis.
fn save_cached_model(dir: &Path, key: u64, model: &TrainedModel, n_samples: usize) {
    let artifact = ModelArtifact {
        generated_at: chrono::Utc::now().to_rfc3339(),
        n_samples,
        model: model.clone(),
    };
    let Ok(json) = serde_json::to_string(&artifact) else {
        return;
    };
    let path = cache_path(dir, key);
    let tmp = path.with_extension("json.tmp");
    let _ = fs::create_dir_all(dir);
    if fs::write(&tmp, json).is_ok() {
        let _ = fs::rename(&tmp, &path);
    }
}
