//! IQR outlier capping.
//!
//! Bounds are learned from the train partition only and then applied to every
//! partition. Out-of-range values are replaced by the train median, not clipped.
use ndarray::{Array2, ArrayView1, Axis};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::split::SplitSet;

pub const IQR_FACTOR: f64 = 1.5;

/// Per-column `[lower, upper]` with the replacement value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
    pub median: f64,
}

impl Bounds {
    /// Both ends are inclusive.
    pub fn contains(&self, v: f64) -> bool {
        v >= self.lower && v <= self.upper
    }

    pub fn cap(&self, v: f64) -> f64 {
        if self.contains(v) {
            v
        } else {
            self.median
        }
    }
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn column_bounds(col: ArrayView1<f64>) -> Bounds {
    let mut sorted = col.to_vec();
    sorted.sort_by(f64::total_cmp);
    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    Bounds {
        lower: q1 - IQR_FACTOR * iqr,
        upper: q3 + IQR_FACTOR * iqr,
        median: quantile(&sorted, 0.5),
    }
}

/// Immutable once fitted.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierCapper {
    bounds: Vec<Bounds>,
}

impl OutlierCapper {
    pub fn fit(train: &Array2<f64>) -> Result<Self> {
        if train.nrows() == 0 {
            return Err(PipelineError::EmptyPartition("train"));
        }
        let bounds = train.axis_iter(Axis(1)).map(column_bounds).collect();
        Ok(Self { bounds })
    }

    pub fn bounds(&self) -> &[Bounds] {
        &self.bounds
    }

    /// Returns a capped copy; the input is left as is.
    pub fn apply(&self, table: &Array2<f64>) -> Result<Array2<f64>> {
        if table.ncols() != self.bounds.len() {
            return Err(PipelineError::Model(format!(
                "capper fitted on {} columns, table has {}",
                self.bounds.len(),
                table.ncols()
            )));
        }
        let mut out = table.clone();
        for (mut col, b) in out.axis_iter_mut(Axis(1)).zip(&self.bounds) {
            col.mapv_inplace(|v| b.cap(v));
        }
        Ok(out)
    }

    /// Number of cells `apply` would replace.
    pub fn count_outliers(&self, table: &Array2<f64>) -> usize {
        table
            .axis_iter(Axis(1))
            .zip(&self.bounds)
            .map(|(col, b)| col.iter().filter(|&&v| !b.contains(v)).count())
            .sum()
    }

    /// Fits on `split.train` and caps all three partitions with the same bounds.
    pub fn fit_apply(split: &SplitSet) -> Result<(Self, SplitSet)> {
        let capper = Self::fit(&split.train.table.features)?;
        let mut capped = split.clone();
        for part in [&mut capped.train, &mut capped.validation, &mut capped.test] {
            let n = capper.count_outliers(&part.table.features);
            part.table.features = capper.apply(&part.table.features)?;
            info!(rows = part.len(), replaced = n, "capped partition");
        }
        Ok((capper, capped))
    }
}
