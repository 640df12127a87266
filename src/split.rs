// Reproducible train / validation / test partitioning.
use ndarray::{Array1, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::SplitConfig;
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;

/// One partition: its rows plus the positions they had in the input table.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub rows: Vec<usize>,
    pub table: FeatureTable,
}

impl Partition {
    fn take(table: &FeatureTable, rows: Vec<usize>) -> Self {
        let features = table.features.select(Axis(0), &rows);
        let targets = Array1::from(rows.iter().map(|&i| table.targets[i]).collect::<Vec<_>>());
        Partition {
            rows,
            table: FeatureTable { features, targets },
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitSet {
    pub train: Partition,
    pub validation: Partition,
    pub test: Partition,
}

/// Shuffles `0..n` with a fresh generator seeded by `seed` and moves the first
/// `ceil(fraction * n)` positions into the held-out side.
fn holdout(indices: &[usize], fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut shuffled = indices.to_vec();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    shuffled.shuffle(&mut rng);
    let n_out = ((fraction * indices.len() as f64).ceil() as usize).min(indices.len());
    let kept = shuffled.split_off(n_out);
    (kept, shuffled)
}

/// Holds out `test_fraction` of all rows, then `validation_fraction_of_remainder`
/// of what is left. Both draws reuse the configured seed, so the same input and
/// config always give the same partitions.
pub fn plan(table: &FeatureTable, cfg: &SplitConfig) -> Result<SplitSet> {
    cfg.validate()?;
    let all: Vec<usize> = (0..table.n_rows()).collect();

    let (remainder, test_rows) = holdout(&all, cfg.test_fraction, cfg.seed);
    let (train_rows, val_rows) =
        holdout(&remainder, cfg.validation_fraction_of_remainder, cfg.seed);

    if train_rows.is_empty() {
        return Err(PipelineError::EmptyPartition("train"));
    }

    let split = SplitSet {
        train: Partition::take(table, train_rows),
        validation: Partition::take(table, val_rows),
        test: Partition::take(table, test_rows),
    };
    info!(
        train = split.train.len(),
        validation = split.validation.len(),
        test = split.test.len(),
        "split data"
    );
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::collections::HashSet;

    fn table(n: usize) -> FeatureTable {
        FeatureTable {
            features: Array2::from_shape_fn((n, 3), |(i, j)| (i * 10 + j) as f64),
            targets: Array1::from_shape_fn(n, |i| i as f64),
        }
    }

    #[test]
    fn test_partitions_disjoint_and_exhaustive() {
        let t = table(103);
        let s = plan(&t, &SplitConfig::default()).unwrap();

        assert_eq!(s.train.len() + s.validation.len() + s.test.len(), 103);
        let mut seen = HashSet::new();
        for r in s.train.rows.iter().chain(&s.validation.rows).chain(&s.test.rows) {
            assert!(seen.insert(*r), "row {r} in more than one partition");
        }
        assert_eq!(seen.len(), 103);
    }

    #[test]
    fn test_sizes_follow_fractions() {
        let s = plan(&table(100), &SplitConfig::default()).unwrap();
        assert_eq!(s.test.len(), 20);
        assert_eq!(s.validation.len(), 20);
        assert_eq!(s.train.len(), 60);
    }

    #[test]
    fn test_same_seed_same_partitions() {
        let t = table(250);
        let cfg = SplitConfig {
            test_fraction: 0.2,
            validation_fraction_of_remainder: 0.25,
            seed: 42,
        };
        let a = plan(&t, &cfg).unwrap();
        let b = plan(&t, &cfg).unwrap();
        assert_eq!(a, b);
        for (x, y) in a.train.table.features.iter().zip(b.train.table.features.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_different_seed_moves_rows() {
        let t = table(250);
        let a = plan(&t, &SplitConfig::default()).unwrap();
        let b = plan(&t, &SplitConfig { seed: 7, ..Default::default() }).unwrap();
        assert_ne!(a.test.rows, b.test.rows);
    }

    #[test]
    fn test_rows_carry_their_targets() {
        let t = table(40);
        let s = plan(&t, &SplitConfig::default()).unwrap();
        for p in [&s.train, &s.validation, &s.test] {
            for (k, &row) in p.rows.iter().enumerate() {
                assert_eq!(p.table.targets[k], row as f64);
                assert_eq!(p.table.features[[k, 0]], (row * 10) as f64);
            }
        }
    }

    #[test]
    fn test_tiny_table_leaves_train_empty() {
        assert!(matches!(
            plan(&table(1), &SplitConfig::default()),
            Err(PipelineError::EmptyPartition("train"))
        ));
    }
}
