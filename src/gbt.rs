use serde::{Deserialize, Serialize};

use crate::error::SimError;

pub const MAX_DEPTH: usize = 4;
pub const ROUNDS: usize = 200;
pub const LEARNING_RATE: f64 = 0.05;
/// Stop when the holdout log-loss has not improved for this many rounds.
pub const EARLY_STOP_ROUNDS: usize = 20;
/// L2 on leaf weights.
const LEAF_LAMBDA: f64 = 1.0;
/// Minimum hessian mass on each side of a split.
const MIN_CHILD_WEIGHT: f64 = 1.0;
const MIN_SPLIT_GAIN: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature: u32,
    pub threshold: f64,
    /// Child indices; -1 marks a leaf.
    pub left: i32,
    pub right: i32,
    /// Leaf weight, already scaled by the learning rate.
    pub value: f64,
    /// Training rows routed through this node.
    pub cover: f64,
}

impl TreeNode {
    fn is_leaf(&self) -> bool {
        self.left < 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
    /// Split gain accumulated per feature while growing this tree.
    pub gains: Vec<f64>,
    /// Cover-weighted expected leaf value.
    pub expected: f64,
}

/// Binary gradient-boosted trees with logistic loss. Depth, rounds and
/// learning rate follow the attribution defaults; training is deterministic
/// (exact greedy splits, no sampling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbtModel {
    pub trees: Vec<Tree>,
    pub base_margin: f64,
    pub n_features: usize,
}

impl GbtModel {
    pub fn margin(&self, row: &[f64]) -> f64 {
        let mut z = self.base_margin;
        for tree in &self.trees {
            z += predict_tree(tree, row);
        }
        z
    }

    pub fn predict_proba(&self, row: &[f64]) -> f64 {
        sigmoid(self.margin(row))
    }

    /// Split gain per feature, normalized to sum to 1 (all zeros when no
    /// split was ever made).
    pub fn importance_scores(&self) -> Vec<f64> {
        let mut gains = vec![0.0; self.n_features];
        for tree in &self.trees {
            for (j, g) in tree.gains.iter().enumerate() {
                gains[j] += g;
            }
        }
        let total: f64 = gains.iter().sum();
        if total > 0.0 {
            for g in &mut gains {
                *g /= total;
            }
        }
        gains
    }

    /// Expected margin over the training distribution; SHAP values sum with
    /// this to the margin of the explained row.
    pub fn base_value(&self) -> f64 {
        self.base_margin + self.trees.iter().map(|t| t.expected).sum::<f64>()
    }

    /// Tree-SHAP (path-weight recursion) in log-odds space. Exact: for any
    /// row, `base_value() + sum(shap(row)) == margin(row)` to float
    /// precision.
    pub fn shap(&self, row: &[f64]) -> Vec<f64> {
        let mut phi = vec![0.0; self.n_features];
        for tree in &self.trees {
            let mut path = Vec::with_capacity(MAX_DEPTH + 2);
            shap_recurse(tree, row, 0, &mut path, 1.0, 1.0, -1, &mut phi);
        }
        phi
    }
}

/// Fit with early stopping on the holdout log-loss. The returned model keeps
/// only the rounds up to the best holdout score.
pub fn fit(
    train_rows: &[&[f64]],
    y_train: &[u8],
    holdout_rows: &[&[f64]],
    y_holdout: &[u8],
    n_features: usize,
) -> Result<GbtModel, SimError> {
    let n = train_rows.len();
    if n == 0 {
        return Err(SimError::ModelFitFailure("empty training set".into()));
    }

    let p0 = (y_train.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64).clamp(1e-6, 1.0 - 1e-6);
    let base_margin = (p0 / (1.0 - p0)).ln();

    let mut train_margins = vec![base_margin; n];
    let mut holdout_margins = vec![base_margin; holdout_rows.len()];
    let mut trees: Vec<Tree> = Vec::with_capacity(ROUNDS);
    let mut best_loss = f64::INFINITY;
    let mut best_rounds = 0usize;

    for round in 0..ROUNDS {
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        for i in 0..n {
            let p = sigmoid(train_margins[i]);
            grad[i] = p - f64::from(y_train[i]);
            hess[i] = (p * (1.0 - p)).max(1e-12);
        }

        let tree = grow_tree(train_rows, &grad, &hess, n_features);

        for (i, row) in train_rows.iter().enumerate() {
            train_margins[i] += predict_tree(&tree, row);
        }
        for (i, row) in holdout_rows.iter().enumerate() {
            holdout_margins[i] += predict_tree(&tree, row);
        }
        trees.push(tree);

        if train_margins.iter().any(|m| !m.is_finite()) {
            return Err(SimError::ModelFitFailure(format!(
                "non-finite margins at round {round}"
            )));
        }

        if holdout_rows.is_empty() {
            best_rounds = trees.len();
            continue;
        }
        let loss = log_loss(&holdout_margins, y_holdout);
        if loss < best_loss - 1e-9 {
            best_loss = loss;
            best_rounds = trees.len();
        } else if trees.len() - best_rounds >= EARLY_STOP_ROUNDS {
            break;
        }
    }

    trees.truncate(best_rounds.max(1));

    Ok(GbtModel {
        trees,
        base_margin,
        n_features,
    })
}

fn grow_tree(rows: &[&[f64]], grad: &[f64], hess: &[f64], n_features: usize) -> Tree {
    let mut tree = Tree {
        nodes: Vec::new(),
        gains: vec![0.0; n_features],
        expected: 0.0,
    };
    let all: Vec<usize> = (0..rows.len()).collect();
    build_node(rows, grad, hess, all, 0, &mut tree);
    tree.expected = expected_value(&tree, 0);
    tree
}

fn build_node(
    rows: &[&[f64]],
    grad: &[f64],
    hess: &[f64],
    indices: Vec<usize>,
    depth: usize,
    tree: &mut Tree,
) -> i32 {
    let g_sum: f64 = indices.iter().map(|&i| grad[i]).sum();
    let h_sum: f64 = indices.iter().map(|&i| hess[i]).sum();
    let cover = indices.len() as f64;

    let leaf = |tree: &mut Tree| -> i32 {
        tree.nodes.push(TreeNode {
            feature: 0,
            threshold: 0.0,
            left: -1,
            right: -1,
            value: -g_sum / (h_sum + LEAF_LAMBDA) * LEARNING_RATE,
            cover,
        });
        (tree.nodes.len() - 1) as i32
    };

    if depth >= MAX_DEPTH || indices.len() < 2 {
        return leaf(tree);
    }

    let Some(split) = best_split(rows, grad, hess, &indices, g_sum, h_sum) else {
        return leaf(tree);
    };

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
        .into_iter()
        .partition(|&i| rows[i][split.feature] <= split.threshold);

    let node_idx = tree.nodes.len();
    tree.nodes.push(TreeNode {
        feature: split.feature as u32,
        threshold: split.threshold,
        left: 0,
        right: 0,
        value: 0.0,
        cover,
    });
    tree.gains[split.feature] += split.gain;

    let left = build_node(rows, grad, hess, left_idx, depth + 1, tree);
    let right = build_node(rows, grad, hess, right_idx, depth + 1, tree);
    tree.nodes[node_idx].left = left;
    tree.nodes[node_idx].right = right;
    node_idx as i32
}

struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

fn best_split(
    rows: &[&[f64]],
    grad: &[f64],
    hess: &[f64],
    indices: &[usize],
    g_sum: f64,
    h_sum: f64,
) -> Option<Split> {
    let n_features = rows[0].len();
    let parent_score = g_sum * g_sum / (h_sum + LEAF_LAMBDA);
    let mut best: Option<Split> = None;

    let mut sorted: Vec<(f64, f64, f64)> = Vec::with_capacity(indices.len());
    for feature in 0..n_features {
        sorted.clear();
        sorted.extend(indices.iter().map(|&i| (rows[i][feature], grad[i], hess[i])));
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut g_left = 0.0;
        let mut h_left = 0.0;
        for w in 0..sorted.len() - 1 {
            g_left += sorted[w].1;
            h_left += sorted[w].2;
            if sorted[w].0 == sorted[w + 1].0 {
                continue;
            }
            let h_right = h_sum - h_left;
            if h_left < MIN_CHILD_WEIGHT || h_right < MIN_CHILD_WEIGHT {
                continue;
            }
            let g_right = g_sum - g_left;
            let gain = 0.5
                * (g_left * g_left / (h_left + LEAF_LAMBDA)
                    + g_right * g_right / (h_right + LEAF_LAMBDA)
                    - parent_score);
            if gain > MIN_SPLIT_GAIN && best.as_ref().is_none_or(|b| gain > b.gain) {
                best = Some(Split {
                    feature,
                    threshold: (sorted[w].0 + sorted[w + 1].0) / 2.0,
                    gain,
                });
            }
        }
    }
    best
}

fn predict_tree(tree: &Tree, row: &[f64]) -> f64 {
    let mut node = &tree.nodes[0];
    while !node.is_leaf() {
        node = if row[node.feature as usize] <= node.threshold {
            &tree.nodes[node.left as usize]
        } else {
            &tree.nodes[node.right as usize]
        };
    }
    node.value
}

fn expected_value(tree: &Tree, node_idx: usize) -> f64 {
    let node = &tree.nodes[node_idx];
    if node.is_leaf() {
        return node.value;
    }
    let left = &tree.nodes[node.left as usize];
    let right = &tree.nodes[node.right as usize];
    (left.cover * expected_value(tree, node.left as usize)
        + right.cover * expected_value(tree, node.right as usize))
        / node.cover
}

// --- Tree-SHAP path recursion ---

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: i32,
    zero: f64,
    one: f64,
    weight: f64,
}

fn extend(path: &mut Vec<PathElement>, zero: f64, one: f64, feature: i32) {
    let len = path.len();
    path.push(PathElement {
        feature,
        zero,
        one,
        weight: if len == 0 { 1.0 } else { 0.0 },
    });
    for i in (0..len).rev() {
        path[i + 1].weight += one * path[i].weight * (i as f64 + 1.0) / (len as f64 + 1.0);
        path[i].weight = zero * path[i].weight * (len as f64 - i as f64) / (len as f64 + 1.0);
    }
}

fn unwind(path: &mut Vec<PathElement>, index: usize) {
    let len = path.len() - 1;
    let one = path[index].one;
    let zero = path[index].zero;
    let mut next = path[len].weight;

    for j in (0..len).rev() {
        if one != 0.0 {
            let tmp = path[j].weight;
            path[j].weight = next * (len as f64 + 1.0) / ((j as f64 + 1.0) * one);
            next = tmp - path[j].weight * zero * (len as f64 - j as f64) / (len as f64 + 1.0);
        } else {
            path[j].weight =
                path[j].weight * (len as f64 + 1.0) / (zero * (len as f64 - j as f64));
        }
    }
    for j in index..len {
        path[j].feature = path[j + 1].feature;
        path[j].zero = path[j + 1].zero;
        path[j].one = path[j + 1].one;
    }
    path.pop();
}

fn unwound_sum(path: &[PathElement], index: usize) -> f64 {
    let len = path.len() - 1;
    let one = path[index].one;
    let zero = path[index].zero;
    let mut total = 0.0;
    let mut next = path[len].weight;

    for j in (0..len).rev() {
        if one != 0.0 {
            let tmp = next * (len as f64 + 1.0) / ((j as f64 + 1.0) * one);
            total += tmp;
            next = path[j].weight - tmp * zero * (len as f64 - j as f64) / (len as f64 + 1.0);
        } else {
            total += path[j].weight * (len as f64 + 1.0) / (zero * (len as f64 - j as f64));
        }
    }
    total
}

#[allow(clippy::too_many_arguments)]
fn shap_recurse(
    tree: &Tree,
    row: &[f64],
    node_idx: usize,
    path: &mut Vec<PathElement>,
    zero: f64,
    one: f64,
    feature: i32,
    phi: &mut [f64],
) {
    extend(path, zero, one, feature);
    let node = &tree.nodes[node_idx];

    if node.is_leaf() {
        for i in 1..path.len() {
            let w = unwound_sum(path, i);
            let el = path[i];
            phi[el.feature as usize] += w * (el.one - el.zero) * node.value;
        }
        return;
    }

    let (hot, cold) = if row[node.feature as usize] <= node.threshold {
        (node.left as usize, node.right as usize)
    } else {
        (node.right as usize, node.left as usize)
    };
    let hot_fraction = tree.nodes[hot].cover / node.cover;
    let cold_fraction = tree.nodes[cold].cover / node.cover;

    let mut incoming_zero = 1.0;
    let mut incoming_one = 1.0;
    if let Some(k) = (1..path.len()).find(|&i| path[i].feature == node.feature as i32) {
        incoming_zero = path[k].zero;
        incoming_one = path[k].one;
        unwind(path, k);
    }

    let mut hot_path = path.clone();
    shap_recurse(
        tree,
        row,
        hot,
        &mut hot_path,
        incoming_zero * hot_fraction,
        incoming_one,
        node.feature as i32,
        phi,
    );
    let mut cold_path = path.clone();
    shap_recurse(
        tree,
        row,
        cold,
        &mut cold_path,
        incoming_zero * cold_fraction,
        0.0,
        node.feature as i32,
        phi,
    );
}

fn log_loss(margins: &[f64], labels: &[u8]) -> f64 {
    let mut sum = 0.0;
    for (&m, &y) in margins.iter().zip(labels) {
        let p = sigmoid(m).clamp(1e-12, 1.0 - 1e-12);
        let p_true = if y == 1 { p } else { 1.0 - p };
        sum += -p_true.ln();
    }
    sum / margins.len().max(1) as f64
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interaction_data() -> (Vec<Vec<f64>>, Vec<u8>) {
        // Label = OR of two binary features: a marginal split helps at the
        // root, but full separation needs the second-level interaction.
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for i in 0..200 {
            let a = f64::from(i % 2 == 0);
            let b = f64::from((i / 2) % 2 == 0);
            rows.push(vec![
                a + (i % 9) as f64 * 0.002,
                b + (i % 11) as f64 * 0.002,
                (i % 13) as f64 / 13.0,
            ]);
            y.push(u8::from(a + b >= 1.0));
        }
        (rows, y)
    }

    fn fit_interaction() -> (GbtModel, Vec<Vec<f64>>, Vec<u8>) {
        let (rows, y) = interaction_data();
        let refs: Vec<&[f64]> = rows.iter().map(Vec::as_slice).collect();
        let (train, holdout) = refs.split_at(160);
        let (y_train, y_holdout) = y.split_at(160);
        let model = fit(train, y_train, holdout, y_holdout, 3).unwrap();
        (model, rows, y)
    }

    #[test]
    fn fits_an_interaction_signal() {
        let (model, rows, y) = fit_interaction();
        let mut correct = 0;
        for (row, &label) in rows.iter().zip(&y) {
            if u8::from(model.predict_proba(row) >= 0.5) == label {
                correct += 1;
            }
        }
        assert!(correct as f64 / rows.len() as f64 > 0.95, "accuracy {correct}/200");
    }

    #[test]
    fn importances_concentrate_on_signal_features() {
        let (model, _, _) = fit_interaction();
        let scores = model.importance_scores();
        assert!((scores.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        // The filler feature carries (almost) no gain.
        assert!(scores[0] + scores[1] > 0.9, "scores {scores:?}");
    }

    #[test]
    fn shap_sums_to_margin_minus_base() {
        let (model, rows, _) = fit_interaction();
        for row in rows.iter().take(25) {
            let phi = model.shap(row);
            let reconstructed = model.base_value() + phi.iter().sum::<f64>();
            assert!(
                (reconstructed - model.margin(row)).abs() < 1e-9,
                "additivity off by {}",
                (reconstructed - model.margin(row)).abs()
            );
        }
    }

    #[test]
    fn shap_matches_brute_force_on_a_small_tree() {
        // Hand-built depth-2 tree over 3 features (feature 2 unused).
        let tree = Tree {
            nodes: vec![
                TreeNode { feature: 0, threshold: 0.5, left: 1, right: 2, value: 0.0, cover: 10.0 },
                TreeNode { feature: 1, threshold: 0.5, left: 3, right: 4, value: 0.0, cover: 6.0 },
                TreeNode { feature: 0, threshold: 0.0, left: -1, right: -1, value: 2.0, cover: 4.0 },
                TreeNode { feature: 0, threshold: 0.0, left: -1, right: -1, value: -1.0, cover: 2.0 },
                TreeNode { feature: 0, threshold: 0.0, left: -1, right: -1, value: 0.5, cover: 4.0 },
            ],
            gains: vec![0.0; 3],
            expected: 0.0,
        };
        let mut tree = tree;
        tree.expected = expected_value(&tree, 0);
        let model = GbtModel {
            trees: vec![tree],
            base_margin: 0.0,
            n_features: 3,
        };

        let row = [0.3, 0.8, 0.1];
        let phi = model.shap(&row);
        let brute = brute_force_shap(&model.trees[0], &row, 3);
        for (p, b) in phi.iter().zip(&brute) {
            assert!((p - b).abs() < 1e-9, "tree-shap {phi:?} vs brute {brute:?}");
        }
    }

    /// Shapley values of the cover-weighted conditional expectation game,
    /// by full subset enumeration.
    fn brute_force_shap(tree: &Tree, row: &[f64], n_features: usize) -> Vec<f64> {
        fn walk(tree: &Tree, row: &[f64], subset: &[bool], node_idx: usize) -> f64 {
            let node = &tree.nodes[node_idx];
            if node.is_leaf() {
                return node.value;
            }
            if subset[node.feature as usize] {
                let next = if row[node.feature as usize] <= node.threshold {
                    node.left
                } else {
                    node.right
                };
                walk(tree, row, subset, next as usize)
            } else {
                let l = &tree.nodes[node.left as usize];
                let r = &tree.nodes[node.right as usize];
                (l.cover * walk(tree, row, subset, node.left as usize)
                    + r.cover * walk(tree, row, subset, node.right as usize))
                    / node.cover
            }
        }

        fn factorial(k: usize) -> f64 {
            (1..=k).map(|v| v as f64).product::<f64>().max(1.0)
        }

        let mut phi = vec![0.0; n_features];
        for target in 0..n_features {
            for mask in 0..(1u32 << n_features) {
                if mask & (1 << target) != 0 {
                    continue;
                }
                let mut subset = vec![false; n_features];
                let mut size = 0;
                for f in 0..n_features {
                    if mask & (1 << f) != 0 {
                        subset[f] = true;
                        size += 1;
                    }
                }
                let without = walk(tree, row, &subset, 0);
                subset[target] = true;
                let with = walk(tree, row, &subset, 0);
                let weight = factorial(size) * factorial(n_features - size - 1)
                    / factorial(n_features);
                phi[target] += weight * (with - without);
            }
        }
        phi
    }

    #[test]
    fn constant_labels_produce_zero_importances() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![(i % 7) as f64, 0.5]).collect();
        let refs: Vec<&[f64]> = rows.iter().map(Vec::as_slice).collect();
        let y = vec![1u8; 40];
        let model = fit(&refs[..32], &y[..32], &refs[32..], &y[32..], 2).unwrap();
        let scores = model.importance_scores();
        assert!(scores.iter().all(|&s| s == 0.0));
        assert!(model.predict_proba(&rows[0]) > 0.95);
    }
}
