// Run configuration: split ratios, ensemble hyperparameters and paths.
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Two-stage random partition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Share of all rows held out as the test partition.
    pub test_fraction: f64,
    /// Share of the non-test rows that becomes the validation partition.
    pub validation_fraction_of_remainder: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            validation_fraction_of_remainder: 0.25,
            seed: 42,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("test_fraction", self.test_fraction),
            (
                "validation_fraction_of_remainder",
                self.validation_fraction_of_remainder,
            ),
        ] {
            if !(v > 0.0 && v < 1.0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must lie strictly between 0 and 1, got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Hyperparameters of the bagged regression-tree ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    /// A node with fewer samples than this becomes a leaf.
    pub min_samples_split: usize,
    /// Every child of a split must keep at least this many samples.
    pub min_samples_leaf: usize,
    /// Features tried per split; `None` tries all of them.
    pub max_features: Option<usize>,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 500,
            max_depth: 30,
            min_samples_split: 10,
            min_samples_leaf: 2,
            max_features: None,
            bootstrap: true,
            seed: 42,
        }
    }
}

impl ForestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(PipelineError::InvalidConfig("n_trees must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(PipelineError::InvalidConfig("max_depth must be at least 1".into()));
        }
        if self.min_samples_split < 2 {
            return Err(PipelineError::InvalidConfig(
                "min_samples_split must be at least 2".into(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(PipelineError::InvalidConfig(
                "min_samples_leaf must be at least 1".into(),
            ));
        }
        if self.max_features == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "max_features must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Which regression capability the trainer fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Forest,
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_path: String,
    pub artifact_path: String,
    pub model: ModelKind,
    pub split: SplitConfig,
    pub forest: ForestConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_path: "data/AirQualityUCI.csv".into(),
            artifact_path: "rf_model.bin".into(),
            model: ModelKind::default(),
            split: SplitConfig::default(),
            forest: ForestConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config file; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::InvalidConfig(format!("{}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;
        if self.model == ModelKind::Forest {
            self.forest.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_run() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.split.test_fraction, 0.2);
        assert_eq!(cfg.split.validation_fraction_of_remainder, 0.25);
        assert_eq!(cfg.split.seed, 42);
        assert_eq!(cfg.forest.n_trees, 500);
        assert_eq!(cfg.forest.max_depth, 30);
        assert_eq!(cfg.forest.min_samples_split, 10);
        assert_eq!(cfg.forest.min_samples_leaf, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_fraction_out_of_range_rejected() {
        let mut cfg = SplitConfig::default();
        cfg.test_fraction = 1.0;
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));
        cfg.test_fraction = 0.2;
        cfg.validation_fraction_of_remainder = 0.0;
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cfg.json");
        let mut f = std::fs::File::create(&path)?;
        writeln!(f, r#"{{"model": "linear", "split": {{"seed": 7}}, "forest": {{"n_trees": 3}}}}"#)?;

        let cfg = PipelineConfig::from_json_file(&path)?;
        assert_eq!(cfg.model, ModelKind::Linear);
        assert_eq!(cfg.split.seed, 7);
        assert_eq!(cfg.split.test_fraction, 0.2);
        assert_eq!(cfg.forest.n_trees, 3);
        assert_eq!(cfg.forest.max_depth, 30);
        Ok(())
    }

    #[test]
    fn test_zero_trees_rejected() {
        let cfg = ForestConfig {
            n_trees: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
