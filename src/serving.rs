//! Prediction path.
//!
//! The artifact is handed in at construction and only ever borrowed, so one
//! service can answer any number of independent requests. A bad request fails
//! on its own and leaves the service untouched.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::features::{self, Feature, FeatureSource, FeatureVector, SnapshotSource};
use crate::model::ModelArtifact;
use crate::preprocess::Channel;
use crate::temporal;

/// Upper limit of the "safe" text band.
///
/// The limits are checked low to high. The older dashboard tested 25 first,
/// so its moderate band could never be reached; this ordering differs from it.
pub const SAFE_LIMIT: f64 = 10.0;
/// Upper limit of the "moderate" text band; anything above is hazardous.
pub const MODERATE_LIMIT: f64 = 25.0;

/// Request body: the 19 pre-encoded fields keyed by payload name.
/// A `null` field counts as missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServingPayload {
    pub fields: HashMap<String, Option<f64>>,
}

impl ServingPayload {
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader(reader)
            .map_err(|e| PipelineError::data_format(e.line() as u64, e.to_string()))
    }

    /// What a client builds after doing its own calendar encoding.
    pub fn from_vector(v: &FeatureVector) -> Self {
        Self {
            fields: v
                .named()
                .map(|(f, x)| (f.payload_key().to_string(), Some(x)))
                .collect(),
        }
    }
}

impl FeatureSource for ServingPayload {
    fn value(&self, feature: Feature) -> Option<f64> {
        self.fields.get(feature.payload_key()).copied().flatten()
    }
}

/// Text banding shown alongside a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HazardBand {
    Safe,
    Moderate,
    Hazardous,
}

impl HazardBand {
    pub fn classify(value: f64) -> Self {
        if value <= SAFE_LIMIT {
            HazardBand::Safe
        } else if value <= MODERATE_LIMIT {
            HazardBand::Moderate
        } else {
            HazardBand::Hazardous
        }
    }
}

impl fmt::Display for HazardBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HazardBand::Safe => "SAFE",
            HazardBand::Moderate => "MODERATE",
            HazardBand::Hazardous => "HAZARDOUS",
        })
    }
}

/// Gauge colour bands. Visual only: the edges differ from [`HazardBand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GaugeBand {
    Green,
    Yellow,
    Orange,
    Red,
}

impl GaugeBand {
    pub fn classify(value: f64) -> Self {
        match value {
            v if v < 15.0 => GaugeBand::Green,
            v if v < 30.0 => GaugeBand::Yellow,
            v if v < 45.0 => GaugeBand::Orange,
            _ => GaugeBand::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    #[serde(rename = "predicted_C6H6(GT)")]
    pub value: f64,
    pub hazard: HazardBand,
    pub gauge: GaugeBand,
}

impl Prediction {
    fn new(value: f64) -> Self {
        Self {
            value,
            hazard: HazardBand::classify(value),
            gauge: GaugeBand::classify(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionService {
    artifact: Arc<ModelArtifact>,
}

impl PredictionService {
    pub fn new(artifact: Arc<ModelArtifact>) -> Self {
        Self { artifact }
    }

    /// Pre-encoded payload, as sent over the wire.
    pub fn predict_payload(&self, payload: &ServingPayload) -> Result<Prediction> {
        let v = features::assemble(payload)?;
        Ok(self.predict_vector(&v))
    }

    /// Raw snapshot: readings plus a calendar day and hour, encoded here with
    /// the same encoder the training run used.
    pub fn predict_snapshot(
        &self,
        readings: &BTreeMap<Channel, f64>,
        date: NaiveDate,
        hour: u32,
    ) -> Result<Prediction> {
        let v = encode_snapshot(readings, date, hour)?;
        Ok(self.predict_vector(&v))
    }

    pub fn predict_vector(&self, v: &FeatureVector) -> Prediction {
        let value = self.artifact.predict(v);
        debug!(value, "prediction");
        Prediction::new(value)
    }
}

/// Readings + date/hour -> feature vector, exactly as a training row is built.
pub fn encode_snapshot(
    readings: &BTreeMap<Channel, f64>,
    date: NaiveDate,
    hour: u32,
) -> Result<FeatureVector> {
    let t = temporal::encode(date, hour)?;
    let v = features::assemble(&SnapshotSource {
        readings,
        temporal: &t,
    })?;
    debug!(
        day = v.get(Feature::DayOfYear),
        hour_sin = v.get(Feature::HourSin),
        hour_cos = v.get(Feature::HourCos),
        "encoded snapshot"
    );
    Ok(v)
}
