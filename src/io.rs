// Module for reading the raw air-quality export and persisting the model artifact.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::model::ModelArtifact;
use crate::preprocess::{Channel, RawRecord};

/// Numbers in the export use a decimal comma: `2,6` means 2.6.
mod decimal_comma {
    use serde::{self, Deserialize, Deserializer};

    pub fn parse(s: &str) -> Result<f64, String> {
        s.trim()
            .replace(',', ".")
            .parse::<f64>()
            .map_err(|_| format!("not a number: {s:?}"))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(d)? {
            Some(s) if !s.trim().is_empty() => parse(&s).map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// One line of `AirQualityUCI.csv`. Trailing unnamed columns are ignored.
#[derive(Debug, Deserialize)]
pub struct AirQualityRow {
    #[serde(rename = "Date")]   pub date: Option<String>,
    #[serde(rename = "Time")]   pub time: Option<String>,
    #[serde(rename = "CO(GT)", deserialize_with = "decimal_comma::deserialize")]
                                pub co_gt: Option<f64>,
    #[serde(rename = "PT08.S1(CO)", deserialize_with = "decimal_comma::deserialize")]
                                pub pt08_s1_co: Option<f64>,
    #[serde(rename = "NMHC(GT)", deserialize_with = "decimal_comma::deserialize")]
                                pub nmhc_gt: Option<f64>,
    #[serde(rename = "C6H6(GT)", deserialize_with = "decimal_comma::deserialize")]
                                pub c6h6_gt: Option<f64>,
    #[serde(rename = "PT08.S2(NMHC)", deserialize_with = "decimal_comma::deserialize")]
                                pub pt08_s2_nmhc: Option<f64>,
    #[serde(rename = "NOx(GT)", deserialize_with = "decimal_comma::deserialize")]
                                pub nox_gt: Option<f64>,
    #[serde(rename = "PT08.S3(NOx)", deserialize_with = "decimal_comma::deserialize")]
                                pub pt08_s3_nox: Option<f64>,
    #[serde(rename = "NO2(GT)", deserialize_with = "decimal_comma::deserialize")]
                                pub no2_gt: Option<f64>,
    #[serde(rename = "PT08.S4(NO2)", deserialize_with = "decimal_comma::deserialize")]
                                pub pt08_s4_no2: Option<f64>,
    #[serde(rename = "PT08.S5(O3)", deserialize_with = "decimal_comma::deserialize")]
                                pub pt08_s5_o3: Option<f64>,
    #[serde(rename = "T", deserialize_with = "decimal_comma::deserialize")]
                                pub t: Option<f64>,
    #[serde(rename = "RH", deserialize_with = "decimal_comma::deserialize")]
                                pub rh: Option<f64>,
    #[serde(rename = "AH", deserialize_with = "decimal_comma::deserialize")]
                                pub ah: Option<f64>,
}

impl From<AirQualityRow> for RawRecord {
    fn from(r: AirQualityRow) -> Self {
        let values = [
            r.co_gt, r.pt08_s1_co, r.nmhc_gt, r.c6h6_gt, r.pt08_s2_nmhc, r.nox_gt,
            r.pt08_s3_nox, r.no2_gt, r.pt08_s4_no2, r.pt08_s5_o3, r.t, r.rh, r.ah,
        ];
        let readings = Channel::ALL
            .into_iter()
            .zip(values)
            .map(|(c, v)| (c, v.unwrap_or(f64::NAN)))
            .collect();
        RawRecord {
            date: r.date.filter(|s| !s.trim().is_empty()),
            time: r.time.filter(|s| !s.trim().is_empty()),
            readings,
        }
    }
}

fn line_of(raw: &StringRecord) -> u64 {
    raw.position().map(|p| p.line()).unwrap_or(0)
}

/// Reads a semicolon-delimited, decimal-comma export.
///
/// Blank rows are skipped. A missing header, a row with the wrong number of
/// fields or a non-numeric reading is a `DataFormat` error: training never
/// continues past a malformed row.
pub fn load_records<R: Read>(reader: R) -> Result<Vec<RawRecord>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| PipelineError::data_format(1, e.to_string()))?
        .clone();
    let expected_len = headers.len();
    for name in ["Date", "Time"]
        .into_iter()
        .chain(Channel::ALL.iter().map(|c| c.column()))
    {
        if !headers.iter().any(|h| h.trim() == name) {
            return Err(PipelineError::data_format(
                1,
                format!("missing column {name:?} (is the file ';'-delimited?)"),
            ));
        }
    }

    let mut out = Vec::new();
    let mut blank = 0usize;
    for result in rdr.records() {
        let raw: StringRecord = result.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            PipelineError::data_format(line, e.to_string())
        })?;

        // 1) skip completely empty lines
        if raw.iter().all(|f| f.trim().is_empty()) {
            blank += 1;
            continue;
        }

        // 2) a short or long row means the file is not what we think it is
        if raw.len() != expected_len {
            return Err(PipelineError::data_format(
                line_of(&raw),
                format!("expected {} fields, found {}", expected_len, raw.len()),
            ));
        }

        // 3) deserialize; unparseable numbers abort the load
        let row: AirQualityRow = raw
            .deserialize(Some(&headers))
            .map_err(|e| PipelineError::data_format(line_of(&raw), e.to_string()))?;
        out.push(RawRecord::from(row));
    }

    if blank > 0 {
        warn!(blank, "skipped blank rows");
    }
    Ok(out)
}

pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let records = load_records(File::open(path)?)?;
    info!(path = %path.display(), rows = records.len(), "loaded raw records");
    Ok(records)
}

/// Sensor snapshot given as `{"CO(GT)": 2.6, ...}`; keys are raw column names.
pub fn load_readings(path: impl AsRef<Path>) -> Result<BTreeMap<Channel, f64>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let raw: BTreeMap<String, f64> = serde_json::from_str(&text)
        .map_err(|e| PipelineError::data_format(e.line() as u64, e.to_string()))?;
    raw.into_iter()
        .map(|(k, v)| {
            Channel::from_column(&k)
                .map(|c| (c, v))
                .ok_or_else(|| PipelineError::data_format(0, format!("unknown channel {k:?}")))
        })
        .collect()
}

/// Writes to a sibling temp file and renames, so a failed run leaves no artifact behind.
pub fn save_artifact(artifact: &ModelArtifact, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("partial");
    let written = File::create(&tmp).map_err(PipelineError::from).and_then(|f| {
        let mut writer = BufWriter::new(f);
        bincode::serialize_into(&mut writer, artifact)
            .map_err(|e| PipelineError::Artifact(e.to_string()))?;
        writer.flush()?;
        Ok(())
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    info!(path = %path.display(), "saved artifact");
    Ok(())
}

pub fn load_artifact(path: impl AsRef<Path>) -> Result<ModelArtifact> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let artifact: ModelArtifact = bincode::deserialize_from(reader)
        .map_err(|e| PipelineError::Artifact(format!("{}: {}", path.display(), e)))?;
    artifact.check_schema()?;
    Ok(artifact)
}
