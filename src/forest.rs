//! Bagged CART regression trees.
//!
//! Each tree draws its bootstrap sample and feature subsets from its own
//! `ChaCha8Rng` seeded with `seed + tree_index`, so the fitted forest does not
//! depend on how rayon schedules the trees.
use linfa::dataset::Dataset;
use linfa::traits::Fit;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Ix1};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ForestConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    root: Node,
}

impl RegressionTree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(n: &Node) -> usize {
            match n {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        walk(&self.root)
    }

    pub fn n_leaves(&self) -> usize {
        fn walk(n: &Node) -> usize {
            match n {
                Node::Leaf { .. } => 1,
                Node::Split { left, right, .. } => walk(left) + walk(right),
            }
        }
        walk(&self.root)
    }
}

struct CandidateSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
    /// Samples going left, sorted by `feature`; the rest go right.
    n_left: usize,
    order: Vec<usize>,
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    cfg: &'a ForestConfig,
    rng: ChaCha8Rng,
}

fn sse(sum: f64, sum_sq: f64, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        (sum_sq - sum * sum / n as f64).max(0.0)
    }
}

impl TreeBuilder<'_> {
    fn leaf(&self, samples: &[usize]) -> Node {
        let sum: f64 = samples.iter().map(|&i| self.y[i]).sum();
        Node::Leaf {
            value: sum / samples.len() as f64,
        }
    }

    fn build(&mut self, samples: Vec<usize>, depth: usize) -> Node {
        let n = samples.len();
        if depth >= self.cfg.max_depth
            || n < self.cfg.min_samples_split
            || n < 2 * self.cfg.min_samples_leaf
        {
            return self.leaf(&samples);
        }

        match self.best_split(&samples) {
            Some(split) => {
                let mut order = split.order;
                let right_samples = order.split_off(split.n_left);
                let left = self.build(order, depth + 1);
                let right = self.build(right_samples, depth + 1);
                Node::Split {
                    feature: split.feature,
                    threshold: split.threshold,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            None => self.leaf(&samples),
        }
    }

    /// Sweeps every candidate feature in sorted order and keeps the split with
    /// the largest drop in squared error that leaves `min_samples_leaf` on both sides.
    fn best_split(&mut self, samples: &[usize]) -> Option<CandidateSplit> {
        let n = samples.len();
        let min_leaf = self.cfg.min_samples_leaf;
        let (total, total_sq) = samples
            .iter()
            .map(|&i| self.y[i])
            .fold((0.0, 0.0), |(s, q), v| (s + v, q + v * v));
        let parent = sse(total, total_sq, n);
        if parent <= f64::EPSILON {
            return None;
        }

        let n_features = self.x.ncols();
        let mut features: Vec<usize> = (0..n_features).collect();
        if let Some(k) = self.cfg.max_features.filter(|&k| k < n_features) {
            features.shuffle(&mut self.rng);
            features.truncate(k);
        }

        let mut best: Option<CandidateSplit> = None;
        for f in features {
            let mut order = samples.to_vec();
            order.sort_by(|&a, &b| self.x[[a, f]].total_cmp(&self.x[[b, f]]));

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            let mut found: Option<(usize, f64, f64)> = None;
            for k in 0..n - 1 {
                let v = self.y[order[k]];
                left_sum += v;
                left_sq += v * v;
                let n_left = k + 1;
                if n_left < min_leaf || n - n_left < min_leaf {
                    continue;
                }
                let lo = self.x[[order[k], f]];
                let hi = self.x[[order[k + 1], f]];
                if lo >= hi {
                    continue;
                }
                let children = sse(left_sum, left_sq, n_left)
                    + sse(total - left_sum, total_sq - left_sq, n - n_left);
                let gain = parent - children;
                if found.map_or(true, |(_, _, g)| gain > g) {
                    let mid = lo + (hi - lo) / 2.0;
                    let threshold = if mid < hi { mid } else { lo };
                    found = Some((n_left, threshold, gain));
                }
            }

            if let Some((n_left, threshold, gain)) = found {
                if gain > 0.0 && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(CandidateSplit {
                        feature: f,
                        threshold,
                        gain,
                        n_left,
                        order,
                    });
                }
            }
        }
        best
    }
}

fn fit_tree<'a>(
    x: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    cfg: &'a ForestConfig,
    index: usize,
) -> RegressionTree {
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed.wrapping_add(index as u64));
    let n = x.nrows();
    let samples: Vec<usize> = if cfg.bootstrap {
        (0..n).map(|_| rng.random_range(0..n)).collect()
    } else {
        (0..n).collect()
    };
    let mut builder = TreeBuilder { x, y, cfg, rng };
    RegressionTree {
        root: builder.build(samples, 0),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    config: ForestConfig,
    n_features: usize,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    #[cfg(test)]
    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Mean of the tree outputs.
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let sum: f64 = self.trees.iter().map(|t| t.predict_row(row)).sum();
        sum / self.trees.len() as f64
    }

}

impl Fit<Array2<f64>, Array1<f64>, PipelineError> for ForestConfig {
    type Object = RandomForest;

    fn fit(&self, dataset: &Dataset<f64, f64, Ix1>) -> Result<RandomForest> {
        self.validate()?;
        let x = dataset.records().view();
        let y = dataset.targets().view();
        if x.nrows() == 0 {
            return Err(PipelineError::EmptyPartition("fit"));
        }
        if x.nrows() != y.len() {
            return Err(PipelineError::Model(format!(
                "{} rows but {} targets",
                x.nrows(),
                y.len()
            )));
        }

        let trees: Vec<RegressionTree> = (0..self.n_trees)
            .into_par_iter()
            .map(|i| fit_tree(x, y, self, i))
            .collect();
        debug!(
            trees = trees.len(),
            max_depth = trees.iter().map(RegressionTree::depth).max().unwrap_or(0),
            leaves = trees.iter().map(RegressionTree::n_leaves).sum::<usize>(),
            "fitted forest"
        );

        Ok(RandomForest {
            config: self.clone(),
            n_features: x.ncols(),
            trees,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn step_data(n: usize) -> Dataset<f64, f64, Ix1> {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 });
        let y = Array1::from_shape_fn(n, |i| if i < n / 2 { 1.0 } else { 5.0 });
        Dataset::new(x, y)
    }

    fn small(n_trees: usize) -> ForestConfig {
        ForestConfig {
            n_trees,
            max_depth: 6,
            min_samples_split: 4,
            min_samples_leaf: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_forest_learns_step() {
        let forest = small(20).fit(&step_data(60)).unwrap();
        assert_eq!(forest.n_trees(), 20);
        let low = forest.predict_row(array![5.0, 0.0].view());
        let high = forest.predict_row(array![55.0, 0.0].view());
        assert!(low < 2.0, "low side predicted {low}");
        assert!(high > 4.0, "high side predicted {high}");
    }

    #[test]
    fn test_fixed_seed_reproducible() {
        let data = step_data(80);
        let a = small(8).fit(&data).unwrap();
        let b = small(8).fit(&data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_count_does_not_change_forest() {
        let data = step_data(80);
        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| small(6).fit(&data).unwrap());
        let multi = small(6).fit(&data).unwrap();
        assert_eq!(single, multi);
    }

    #[test]
    fn test_min_samples_leaf_respected() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = array![0.0, 10.0, 10.0, 10.0, 10.0, 10.0];
        let cfg = ForestConfig {
            n_trees: 1,
            bootstrap: false,
            min_samples_split: 2,
            min_samples_leaf: 2,
            ..Default::default()
        };
        let forest = cfg.fit(&Dataset::new(x, y)).unwrap();
        // a leaf holding only the first sample would predict exactly 0
        assert!(forest.predict_row(array![0.0].view()) > 0.0);
    }

    #[test]
    fn test_constant_target_is_single_leaf() {
        let x = Array2::from_shape_fn((20, 3), |(i, j)| (i + j) as f64);
        let y = Array1::from_elem(20, 7.5);
        let forest = small(3).fit(&Dataset::new(x, y)).unwrap();
        for t in forest.trees() {
            assert_eq!(t.n_leaves(), 1);
        }
        assert_eq!(forest.predict_row(array![1.0, 2.0, 3.0].view()), 7.5);
    }

    #[test]
    fn test_max_depth_caps_tree() {
        let x = Array2::from_shape_fn((64, 1), |(i, _)| i as f64);
        let y = Array1::from_shape_fn(64, |i| (i * i) as f64);
        let cfg = ForestConfig {
            n_trees: 2,
            max_depth: 3,
            min_samples_split: 2,
            min_samples_leaf: 1,
            ..Default::default()
        };
        let forest = cfg.fit(&Dataset::new(x, y)).unwrap();
        assert!(forest.trees().iter().all(|t| t.depth() <= 3));
    }

    #[test]
    fn test_empty_dataset_rejected() {
        let data = Dataset::new(Array2::<f64>::zeros((0, 2)), Array1::<f64>::zeros(0));
        assert!(small(2).fit(&data).is_err());
    }
}
