//! The canonical feature schema.
//!
//! [`Feature::ORDER`] is the only place the 19-element order is written down.
//! Training rows, raw serving snapshots and pre-encoded serving payloads all
//! go through [`assemble`], so they cannot disagree about position or naming.
use std::collections::BTreeMap;

use ndarray::{aview1, Array1, Array2};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::preprocess::{Channel, CleanedRecord};
use crate::temporal::{self, TemporalFeatures};

pub const FEATURE_COUNT: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    CoGt,
    Pt08S1Co,
    Pt08S2Nmhc,
    NoxGt,
    Pt08S3Nox,
    No2Gt,
    Pt08S4No2,
    Pt08S5O3,
    Temperature,
    RelativeHumidity,
    AbsoluteHumidity,
    Year,
    DayOfYear,
    HourSin,
    HourCos,
    MonthSin,
    MonthCos,
    WeekdaySin,
    WeekdayCos,
}

impl Feature {
    pub const ORDER: [Feature; FEATURE_COUNT] = [
        Feature::CoGt,
        Feature::Pt08S1Co,
        Feature::Pt08S2Nmhc,
        Feature::NoxGt,
        Feature::Pt08S3Nox,
        Feature::No2Gt,
        Feature::Pt08S4No2,
        Feature::Pt08S5O3,
        Feature::Temperature,
        Feature::RelativeHumidity,
        Feature::AbsoluteHumidity,
        Feature::Year,
        Feature::DayOfYear,
        Feature::HourSin,
        Feature::HourCos,
        Feature::MonthSin,
        Feature::MonthCos,
        Feature::WeekdaySin,
        Feature::WeekdayCos,
    ];

    /// Column name used in the training table and stored in the artifact.
    pub fn column(self) -> &'static str {
        match self {
            Feature::Year => "Year",
            Feature::DayOfYear => "Day",
            Feature::HourSin => "Hour_sin",
            Feature::HourCos => "Hour_cos",
            Feature::MonthSin => "Month_sin",
            Feature::MonthCos => "Month_cos",
            Feature::WeekdaySin => "Weekday_sin",
            Feature::WeekdayCos => "Weekday_cos",
            sensor => sensor.channel().map_or("", Channel::column),
        }
    }

    /// Key of the field in a serving payload.
    pub fn payload_key(self) -> &'static str {
        match self {
            Feature::CoGt => "CO_GT",
            Feature::Pt08S1Co => "PT08_S1_CO",
            Feature::Pt08S2Nmhc => "PT08_S2_NMHC",
            Feature::NoxGt => "NOx_GT",
            Feature::Pt08S3Nox => "PT08_S3_NOx",
            Feature::No2Gt => "NO2_GT",
            Feature::Pt08S4No2 => "PT08_S4_NO2",
            Feature::Pt08S5O3 => "PT08_S5_O3",
            Feature::Temperature => "T",
            Feature::RelativeHumidity => "RH",
            Feature::AbsoluteHumidity => "AH",
            other => other.column(),
        }
    }

    /// Raw channel a sensor or environmental feature is copied from.
    pub fn channel(self) -> Option<Channel> {
        Some(match self {
            Feature::CoGt => Channel::CoGt,
            Feature::Pt08S1Co => Channel::Pt08S1Co,
            Feature::Pt08S2Nmhc => Channel::Pt08S2Nmhc,
            Feature::NoxGt => Channel::NoxGt,
            Feature::Pt08S3Nox => Channel::Pt08S3Nox,
            Feature::No2Gt => Channel::No2Gt,
            Feature::Pt08S4No2 => Channel::Pt08S4No2,
            Feature::Pt08S5O3 => Channel::Pt08S5O3,
            Feature::Temperature => Channel::Temperature,
            Feature::RelativeHumidity => Channel::RelativeHumidity,
            Feature::AbsoluteHumidity => Channel::AbsoluteHumidity,
            _ => return None,
        })
    }

    /// Value of a derived calendar feature.
    pub fn temporal_value(self, t: &TemporalFeatures) -> Option<f64> {
        Some(match self {
            Feature::Year => t.year as f64,
            Feature::DayOfYear => t.day_of_year as f64,
            Feature::HourSin => t.hour_sin,
            Feature::HourCos => t.hour_cos,
            Feature::MonthSin => t.month_sin,
            Feature::MonthCos => t.month_cos,
            Feature::WeekdaySin => t.weekday_sin,
            Feature::WeekdayCos => t.weekday_cos,
            _ => return None,
        })
    }

    pub fn column_names() -> Vec<String> {
        Feature::ORDER.iter().map(|f| f.column().to_string()).collect()
    }
}

/// Fixed-order, fixed-length model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    /// Variants are declared in schema order, so the discriminant is the column.
    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature as usize]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Named pairs in schema order.
    pub fn named(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        Feature::ORDER.iter().copied().zip(self.0.iter().copied())
    }
}

/// Anything that can answer "what is the value of this feature".
pub trait FeatureSource {
    fn value(&self, feature: Feature) -> Option<f64>;
}

/// Sensor readings plus an encoded timestamp. Used for cleaned training rows
/// and for raw serving snapshots alike.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotSource<'a> {
    pub readings: &'a BTreeMap<Channel, f64>,
    pub temporal: &'a TemporalFeatures,
}

impl FeatureSource for SnapshotSource<'_> {
    fn value(&self, feature: Feature) -> Option<f64> {
        match feature.channel() {
            Some(c) => self.readings.get(&c).copied(),
            None => feature.temporal_value(self.temporal),
        }
    }
}

/// Resolves every feature in schema order. Unresolvable or non-finite
/// values fail with the payload key of the first offender.
pub fn assemble<S: FeatureSource + ?Sized>(source: &S) -> Result<FeatureVector> {
    let mut out = [0.0; FEATURE_COUNT];
    for (slot, feature) in out.iter_mut().zip(Feature::ORDER) {
        *slot = source
            .value(feature)
            .filter(|v| v.is_finite())
            .ok_or_else(|| PipelineError::MissingFeature(feature.payload_key().to_string()))?;
    }
    Ok(FeatureVector(out))
}

/// Feature matrix and target column of the cleaned table, row order preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub features: Array2<f64>,
    pub targets: Array1<f64>,
}

impl FeatureTable {
    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }
}

/// Encodes and assembles each cleaned row. Any failure here aborts training.
pub fn build_table(records: &[CleanedRecord]) -> Result<FeatureTable> {
    let mut features = Array2::zeros((records.len(), FEATURE_COUNT));
    let mut targets = Array1::zeros(records.len());

    for (i, rec) in records.iter().enumerate() {
        let t = temporal::encode(rec.date, rec.hour)?;
        let v = assemble(&SnapshotSource {
            readings: &rec.readings,
            temporal: &t,
        })?;
        features.row_mut(i).assign(&aview1(&v.0));
        targets[i] = rec
            .target()
            .ok_or_else(|| PipelineError::MissingFeature(Channel::TARGET.column().to_string()))?;
    }

    debug!(rows = records.len(), cols = FEATURE_COUNT, "built feature table");
    Ok(FeatureTable { features, targets })
}
