//! Decision-tree regression with binned continuous splits and variance impurity.

use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WinetrackError};

/// Deepest tree the regressor will grow.
pub const MAX_SUPPORTED_DEPTH: usize = 30;

/// Tree node. Internal nodes keep their own prediction and impurity so the
/// exported node table is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        prediction: f64,
        impurity: f64,
        count: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        gain: f64,
        prediction: f64,
        impurity: f64,
        count: usize,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    pub fn prediction(&self) -> f64 {
        match self {
            Node::Leaf { prediction, .. } | Node::Split { prediction, .. } => *prediction,
        }
    }

    fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    fn num_nodes(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Split { left, right, .. } => 1 + left.num_nodes() + right.num_nodes(),
        }
    }

    fn predict(&self, sample: ArrayView1<'_, f64>) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { prediction, .. } => return *prediction,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    node = if sample[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    fn write_subtree(&self, out: &mut String, indent: usize) {
        let prefix = " ".repeat(indent);
        match self {
            Node::Leaf { prediction, .. } => {
                out.push_str(&format!("{prefix}Predict: {prediction:?}\n"));
            }
            Node::Split {
                feature,
                threshold,
                left,
                right,
                ..
            } => {
                out.push_str(&format!("{prefix}If (feature {feature} <= {threshold:?})\n"));
                left.write_subtree(out, indent + 1);
                out.push_str(&format!("{prefix}Else (feature {feature} > {threshold:?})\n"));
                right.write_subtree(out, indent + 1);
            }
        }
    }
}

/// Unfitted regressor and its hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionTreeRegressor {
    pub max_depth: usize,
    pub max_bins: usize,
    pub min_instances_per_node: usize,
    pub min_info_gain: f64,
}

impl Default for DecisionTreeRegressor {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_bins: 32,
            min_instances_per_node: 1,
            min_info_gain: 0.0,
        }
    }
}

/// Per-bin label sums used to score every candidate split of a node.
#[derive(Debug, Clone, Copy, Default)]
struct Stats {
    count: usize,
    sum: f64,
    sum_sq: f64,
}

impl Stats {
    fn add(&mut self, y: f64) {
        self.count += 1;
        self.sum += y;
        self.sum_sq += y * y;
    }

    fn merge(&mut self, other: &Stats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    fn subtract(&self, other: &Stats) -> Stats {
        Stats {
            count: self.count - other.count,
            sum: self.sum - other.sum,
            sum_sq: self.sum_sq - other.sum_sq,
        }
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        (self.sum_sq / n - (self.sum / n).powi(2)).max(0.0)
    }
}

struct SplitCandidate {
    feature: usize,
    bin: u16,
    threshold: f64,
    gain: f64,
}

/// Training data after binning: thresholds per feature and each row's bin per feature.
struct Binned<'a> {
    thresholds: Vec<Vec<f64>>,
    bins: Vec<Vec<u16>>,
    y: &'a Array1<f64>,
}

impl DecisionTreeRegressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_bins(mut self, bins: usize) -> Self {
        self.max_bins = bins;
        self
    }

    pub fn with_min_instances_per_node(mut self, n: usize) -> Self {
        self.min_instances_per_node = n;
        self
    }

    pub fn with_min_info_gain(mut self, gain: f64) -> Self {
        self.min_info_gain = gain;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_depth > MAX_SUPPORTED_DEPTH {
            return Err(WinetrackError::InvalidParam(format!(
                "maxDepth must be in [0, {MAX_SUPPORTED_DEPTH}], got {}",
                self.max_depth
            )));
        }
        if self.max_bins < 2 || self.max_bins > u16::MAX as usize {
            return Err(WinetrackError::InvalidParam(format!(
                "maxBins must be in [2, {}], got {}",
                u16::MAX,
                self.max_bins
            )));
        }
        if self.min_instances_per_node < 1 {
            return Err(WinetrackError::InvalidParam(
                "minInstancesPerNode must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Fit a tree to `x` (rows × features) and `y`.
    pub fn fit(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<DecisionTreeRegressionModel> {
        self.validate()?;
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 {
            return Err(WinetrackError::EmptyDataset);
        }
        if y.len() != n_rows {
            return Err(WinetrackError::InvalidParam(format!(
                "label length {} does not match {} feature rows",
                y.len(),
                n_rows
            )));
        }

        let thresholds: Vec<Vec<f64>> = (0..n_features)
            .into_par_iter()
            .map(|f| find_thresholds(x.column(f), self.max_bins - 1))
            .collect();
        let bins: Vec<Vec<u16>> = (0..n_features)
            .into_par_iter()
            .map(|f| {
                x.column(f)
                    .iter()
                    .map(|v| bin_index(&thresholds[f], *v))
                    .collect()
            })
            .collect();

        let data = Binned { thresholds, bins, y };
        let rows: Vec<usize> = (0..n_rows).collect();
        let root = self.grow(&data, &rows, 0);

        Ok(DecisionTreeRegressionModel {
            uid: crate::new_uid("dtr"),
            num_features: n_features,
            params: self.clone(),
            root,
        })
    }

    fn grow(&self, data: &Binned<'_>, rows: &[usize], depth: usize) -> Node {
        let mut stats = Stats::default();
        for &r in rows {
            stats.add(data.y[r]);
        }
        let leaf = || Node::Leaf {
            prediction: stats.mean(),
            impurity: stats.variance(),
            count: stats.count,
        };

        let pure = rows.iter().all(|&r| data.y[r] == data.y[rows[0]]);
        if depth >= self.max_depth || pure {
            return leaf();
        }
        let Some(best) = self.best_split(data, rows, &stats) else {
            return leaf();
        };
        if best.gain <= 0.0 {
            return leaf();
        }

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| data.bins[best.feature][r] <= best.bin);

        Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            gain: best.gain,
            prediction: stats.mean(),
            impurity: stats.variance(),
            count: stats.count,
            left: Box::new(self.grow(data, &left_rows, depth + 1)),
            right: Box::new(self.grow(data, &right_rows, depth + 1)),
        }
    }

    fn best_split(&self, data: &Binned<'_>, rows: &[usize], parent: &Stats) -> Option<SplitCandidate> {
        let parent_impurity = parent.variance();
        let n = parent.count as f64;

        let per_feature: Vec<Option<SplitCandidate>> = (0..data.thresholds.len())
            .into_par_iter()
            .map(|feature| {
                let thresholds = &data.thresholds[feature];
                if thresholds.is_empty() {
                    return None;
                }
                let mut bin_stats = vec![Stats::default(); thresholds.len() + 1];
                for &r in rows {
                    bin_stats[data.bins[feature][r] as usize].add(data.y[r]);
                }

                let mut best: Option<SplitCandidate> = None;
                let mut left = Stats::default();
                for (split, threshold) in thresholds.iter().enumerate() {
                    left.merge(&bin_stats[split]);
                    let right = parent.subtract(&left);
                    if left.count < self.min_instances_per_node
                        || right.count < self.min_instances_per_node
                    {
                        continue;
                    }
                    let gain = parent_impurity
                        - (left.count as f64 / n) * left.variance()
                        - (right.count as f64 / n) * right.variance();
                    if gain < self.min_info_gain {
                        continue;
                    }
                    if best.as_ref().map_or(true, |b| gain > b.gain) {
                        best = Some(SplitCandidate {
                            feature,
                            bin: split as u16,
                            threshold: *threshold,
                            gain,
                        });
                    }
                }
                best
            })
            .collect();

        // Sequential reduce keeps the lowest feature index on ties.
        let mut best: Option<SplitCandidate> = None;
        for candidate in per_feature.into_iter().flatten() {
            if best.as_ref().map_or(true, |b| candidate.gain > b.gain) {
                best = Some(candidate);
            }
        }
        best
    }
}

/// Candidate thresholds for one continuous feature.
///
/// With few distinct values every midpoint is a candidate; otherwise
/// midpoints are picked where the cumulative count is closest to each
/// multiple of `n / (num_splits + 1)`.
pub fn find_thresholds(values: ArrayView1<'_, f64>, num_splits: usize) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut counts: Vec<(f64, usize)> = Vec::new();
    for v in sorted {
        match counts.last_mut() {
            Some((last, c)) if *last == v => *c += 1,
            _ => counts.push((v, 1)),
        }
    }
    if counts.len() <= 1 {
        return vec![];
    }
    if counts.len() - 1 <= num_splits {
        return counts.windows(2).map(|w| (w[0].0 + w[1].0) / 2.0).collect();
    }

    let total: usize = counts.iter().map(|(_, c)| c).sum();
    let stride = total as f64 / (num_splits + 1) as f64;
    let mut thresholds = Vec::with_capacity(num_splits);
    let mut current = counts[0].1 as f64;
    let mut target = stride;
    for i in 1..counts.len() {
        let previous = current;
        current += counts[i].1 as f64;
        let previous_gap = (previous - target).abs();
        let current_gap = (current - target).abs();
        if previous_gap < current_gap {
            thresholds.push((counts[i - 1].0 + counts[i].0) / 2.0);
            target += stride;
        }
    }
    thresholds
}

/// Index of the first threshold `value` does not exceed, or `thresholds.len()`.
fn bin_index(thresholds: &[f64], value: f64) -> u16 {
    thresholds.partition_point(|t| *t < value) as u16
}

/// A fitted regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTreeRegressionModel {
    pub uid: String,
    pub num_features: usize,
    pub params: DecisionTreeRegressor,
    pub root: Node,
}

impl DecisionTreeRegressionModel {
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.num_features {
            return Err(WinetrackError::InvalidParam(format!(
                "model expects {} features, got {}",
                self.num_features,
                x.ncols()
            )));
        }
        Ok(x.rows().into_iter().map(|row| self.root.predict(row)).collect())
    }

    /// Depth of the deepest leaf; a single-leaf tree has depth 0.
    pub fn depth(&self) -> usize {
        self.root.depth()
    }

    pub fn num_nodes(&self) -> usize {
        self.root.num_nodes()
    }

    /// Human-readable tree structure, one line per split branch or leaf.
    pub fn to_debug_string(&self) -> String {
        let mut out = format!(
            "DecisionTreeRegressionModel: uid={}, depth={}, numNodes={}, numFeatures={}\n",
            self.uid,
            self.depth(),
            self.num_nodes(),
            self.num_features
        );
        self.root.write_subtree(&mut out, 2);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn step_function_is_learned_exactly() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0], [6.0]];
        let y = array![1.0, 1.0, 1.0, 5.0, 5.0, 5.0];

        let model = DecisionTreeRegressor::new().fit(&x, &y).unwrap();
        assert_eq!(model.depth(), 1);
        assert_eq!(model.num_nodes(), 3);
        assert_eq!(model.predict(&x).unwrap(), y);

        match &model.root {
            Node::Split {
                feature, threshold, ..
            } => {
                assert_eq!(*feature, 0);
                assert_eq!(*threshold, 3.5);
            }
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn max_depth_limits_growth() {
        let x = Array2::from_shape_fn((64, 1), |(i, _)| i as f64);
        let y = Array1::from_shape_fn(64, |i| (i * i) as f64);

        for depth in [0, 1, 3] {
            let model = DecisionTreeRegressor::new()
                .with_max_depth(depth)
                .fit(&x, &y)
                .unwrap();
            assert_eq!(model.depth(), depth);
        }
    }

    #[test]
    fn depth_zero_predicts_label_mean() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![2.0, 4.0, 6.0, 8.0];
        let model = DecisionTreeRegressor::new().with_max_depth(0).fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), array![5.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn picks_the_informative_feature() {
        let x = array![[0.0, 7.0], [1.0, 3.0], [0.0, 3.0], [1.0, 7.0]];
        let y = array![10.0, 20.0, 20.0, 10.0];
        let model = DecisionTreeRegressor::new().with_max_depth(1).fit(&x, &y).unwrap();
        match model.root {
            Node::Split { feature, .. } => assert_eq!(feature, 1),
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn thresholds_use_all_midpoints_when_few_values() {
        let values = array![3.0, 1.0, 2.0, 2.0];
        assert_eq!(find_thresholds(values.view(), 31), vec![1.5, 2.5]);
        assert!(find_thresholds(array![4.0, 4.0].view(), 31).is_empty());
    }

    #[test]
    fn thresholds_are_capped_by_max_bins() {
        let values = Array1::from_shape_fn(1000, |i| i as f64);
        let thresholds = find_thresholds(values.view(), 3);
        assert_eq!(thresholds.len(), 3);
        assert!(thresholds.windows(2).all(|w| w[0] < w[1]));
        // Roughly at the quartiles.
        assert!((thresholds[0] - 249.5).abs() < 2.0, "{thresholds:?}");
        assert!((thresholds[1] - 499.5).abs() < 2.0, "{thresholds:?}");
    }

    #[test]
    fn invalid_params_are_rejected() {
        let x = array![[1.0], [2.0]];
        let y = array![1.0, 2.0];
        assert!(DecisionTreeRegressor::new().with_max_bins(1).fit(&x, &y).is_err());
        assert!(DecisionTreeRegressor::new().with_max_depth(31).fit(&x, &y).is_err());
    }

    #[test]
    fn debug_string_layout() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = array![5.0, 5.0, 6.0, 6.5];
        let model = DecisionTreeRegressor::new().with_max_depth(1).fit(&x, &y).unwrap();

        let expected = format!(
            "DecisionTreeRegressionModel: uid={}, depth=1, numNodes=3, numFeatures=1\n  \
             If (feature 0 <= 2.5)\n   Predict: 5.0\n  Else (feature 0 > 2.5)\n   Predict: 6.25\n",
            model.uid
        );
        assert_eq!(model.to_debug_string(), expected);
        assert!(model.uid.starts_with("dtr_"));
    }

    #[test]
    fn predict_checks_feature_count() {
        let x = array![[1.0, 2.0], [2.0, 3.0]];
        let y = array![1.0, 2.0];
        let model = DecisionTreeRegressor::new().fit(&x, &y).unwrap();
        assert!(model.predict(&array![[1.0]]).is_err());
    }
}
