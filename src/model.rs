/// Fit the regression capability on train + validation and score held-out rows.
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{concatenate, Array1, Array2, ArrayView1, Axis, Ix1};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{ModelKind, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::features::{Feature, FeatureTable, FeatureVector, FEATURE_COUNT};
use crate::forest::RandomForest;
use crate::split::SplitSet;

/// The predict half of any swappable regressor.
pub trait Regressor {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64;

    fn predict_table(&self, x: &Array2<f64>) -> Array1<f64> {
        x.outer_iter().map(|row| self.predict_row(row)).collect()
    }
}

impl Regressor for RandomForest {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        RandomForest::predict_row(self, row)
    }
}

/// Ordinary least squares, kept as plain numbers so it serialises like the forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearBaseline {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearBaseline {
    pub fn fit(dataset: &Dataset<f64, f64, Ix1>) -> Result<Self> {
        let model = LinearRegression::new()
            .fit(dataset)
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        Ok(Self {
            intercept: model.intercept(),
            coefficients: model.params().to_vec(),
        })
    }
}

impl Regressor for LinearBaseline {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        self.intercept
            + row
                .iter()
                .zip(&self.coefficients)
                .map(|(x, c)| x * c)
                .sum::<f64>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainedModel {
    Forest(RandomForest),
    Linear(LinearBaseline),
}

impl Regressor for TrainedModel {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        match self {
            TrainedModel::Forest(m) => m.predict_row(row),
            TrainedModel::Linear(m) => Regressor::predict_row(m, row),
        }
    }
}

/// The one thing a training run persists. Serving only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Column order the model was fitted on.
    pub feature_names: Vec<String>,
    pub model: TrainedModel,
}

impl ModelArtifact {
    pub fn new(model: TrainedModel) -> Self {
        Self {
            feature_names: Feature::column_names(),
            model,
        }
    }

    /// Fails if the stored column order differs from the compiled schema, or
    /// the model was fitted on a different width.
    pub fn check_schema(&self) -> Result<()> {
        let expected = Feature::column_names();
        if self.feature_names != expected {
            return Err(PipelineError::Artifact(format!(
                "feature order mismatch: artifact has {:?}, expected {:?}",
                self.feature_names, expected
            )));
        }
        let width = match &self.model {
            TrainedModel::Forest(f) => f.n_features(),
            TrainedModel::Linear(l) => l.coefficients.len(),
        };
        if width != FEATURE_COUNT {
            return Err(PipelineError::Artifact(format!(
                "model expects {width} features, schema has {FEATURE_COUNT}"
            )));
        }
        Ok(())
    }

    pub fn predict(&self, v: &FeatureVector) -> f64 {
        self.model.predict_row(ArrayView1::from(v.as_slice()))
    }

    pub fn predict_table(&self, x: &Array2<f64>) -> Array1<f64> {
        self.model.predict_table(x)
    }
}

/// Stacks train on top of validation; test is never part of the fit.
pub fn fit_dataset(split: &SplitSet) -> Result<Dataset<f64, f64, Ix1>> {
    let train = &split.train.table;
    let val = &split.validation.table;
    let x = concatenate(Axis(0), &[train.features.view(), val.features.view()])
        .map_err(|e| PipelineError::Model(e.to_string()))?;
    let y = concatenate(Axis(0), &[train.targets.view(), val.targets.view()])
        .map_err(|e| PipelineError::Model(e.to_string()))?;
    Ok(Dataset::new(x, y).with_feature_names(Feature::column_names()))
}

pub fn train(capped: &SplitSet, cfg: &PipelineConfig) -> Result<ModelArtifact> {
    let dataset = fit_dataset(capped)?;
    info!(rows = dataset.nsamples(), model = ?cfg.model, "fitting final model");

    let model = match cfg.model {
        ModelKind::Forest => {
            let forest = cfg.forest.fit(&dataset)?;
            info!(trees = forest.n_trees(), features = forest.n_features(), "forest ready");
            TrainedModel::Forest(forest)
        }
        ModelKind::Linear => TrainedModel::Linear(LinearBaseline::fit(&dataset)?),
    };
    Ok(ModelArtifact::new(model))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub rows: usize,
    pub r2: f64,
    pub mae: f64,
    pub mse: f64,
}

/// Scores a held-out table. Reporting only; nothing here feeds back into the fit.
pub fn evaluate(artifact: &ModelArtifact, held_out: &FeatureTable) -> Result<Evaluation> {
    if held_out.n_rows() == 0 {
        return Err(PipelineError::EmptyPartition("test"));
    }
    let predicted = artifact.predict_table(&held_out.features);
    Ok(Evaluation {
        rows: held_out.n_rows(),
        r2: predicted.r2(&held_out.targets)?,
        mae: predicted.mean_absolute_error(&held_out.targets)?,
        mse: predicted.mean_squared_error(&held_out.targets)?,
    })
}
