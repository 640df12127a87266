// Data cleaning: duplicate removal, sentinel handling, mean imputation.
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::temporal;

/// Raw exports mark an unmeasured reading with this value.
pub const SENTINEL_MISSING: f64 = -200.0;

/// Numeric columns of the raw air-quality export, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    CoGt,
    Pt08S1Co,
    NmhcGt,
    C6h6Gt,
    Pt08S2Nmhc,
    NoxGt,
    Pt08S3Nox,
    No2Gt,
    Pt08S4No2,
    Pt08S5O3,
    Temperature,
    RelativeHumidity,
    AbsoluteHumidity,
}

impl Channel {
    pub const ALL: [Channel; 13] = [
        Channel::CoGt,
        Channel::Pt08S1Co,
        Channel::NmhcGt,
        Channel::C6h6Gt,
        Channel::Pt08S2Nmhc,
        Channel::NoxGt,
        Channel::Pt08S3Nox,
        Channel::No2Gt,
        Channel::Pt08S4No2,
        Channel::Pt08S5O3,
        Channel::Temperature,
        Channel::RelativeHumidity,
        Channel::AbsoluteHumidity,
    ];

    /// Sparse channel removed before imputation and never reconstructed.
    pub const DROPPED: Channel = Channel::NmhcGt;

    /// Benzene concentration, the regression target.
    pub const TARGET: Channel = Channel::C6h6Gt;

    /// Header name in the raw export.
    pub fn column(self) -> &'static str {
        match self {
            Channel::CoGt => "CO(GT)",
            Channel::Pt08S1Co => "PT08.S1(CO)",
            Channel::NmhcGt => "NMHC(GT)",
            Channel::C6h6Gt => "C6H6(GT)",
            Channel::Pt08S2Nmhc => "PT08.S2(NMHC)",
            Channel::NoxGt => "NOx(GT)",
            Channel::Pt08S3Nox => "PT08.S3(NOx)",
            Channel::No2Gt => "NO2(GT)",
            Channel::Pt08S4No2 => "PT08.S4(NO2)",
            Channel::Pt08S5O3 => "PT08.S5(O3)",
            Channel::Temperature => "T",
            Channel::RelativeHumidity => "RH",
            Channel::AbsoluteHumidity => "AH",
        }
    }

    pub fn from_column(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.column() == name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// One row as loaded. Missing readings are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub date: Option<String>,
    pub time: Option<String>,
    pub readings: BTreeMap<Channel, f64>,
}

impl RawRecord {
    /// NaN for channels that are absent or unmeasured.
    pub fn reading(&self, channel: Channel) -> f64 {
        self.readings.get(&channel).copied().unwrap_or(f64::NAN)
    }

    /// Duplicate-detection key: bit patterns make NaN compare equal to NaN.
    fn dedup_key(&self) -> (Option<&str>, Option<&str>, Vec<u64>) {
        let values = Channel::ALL
            .iter()
            .map(|&c| {
                let v = self.reading(c);
                if v.is_nan() {
                    u64::MAX
                } else {
                    v.to_bits()
                }
            })
            .collect();
        (self.date.as_deref(), self.time.as_deref(), values)
    }
}

/// A fully-populated row ready for feature assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedRecord {
    pub date: NaiveDate,
    pub hour: u32,
    /// Every channel except [`Channel::DROPPED`]; all finite.
    pub readings: BTreeMap<Channel, f64>,
}

impl CleanedRecord {
    pub fn target(&self) -> Option<f64> {
        self.readings.get(&Channel::TARGET).copied()
    }
}

/// Per-run cleaning summary, logged by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleaningReport {
    pub input_rows: usize,
    pub duplicates_removed: usize,
    /// Channel mean used to fill gaps, with the number of cells it filled.
    pub imputed: BTreeMap<Channel, (f64, usize)>,
    pub rows_dropped: usize,
}

/// Removes duplicates, turns sentinels into NaN, drops the sparse channel,
/// mean-imputes the remaining channels and discards rows that still have a gap.
///
/// Means come from the whole table at this stage, before any split.
pub fn clean(records: &[RawRecord]) -> (Vec<CleanedRecord>, CleaningReport) {
    let mut report = CleaningReport {
        input_rows: records.len(),
        ..Default::default()
    };

    // 1) exact duplicates, keep first
    let mut seen = HashSet::new();
    let unique: Vec<&RawRecord> = records
        .iter()
        .filter(|r| seen.insert(r.dedup_key()))
        .collect();
    report.duplicates_removed = records.len() - unique.len();

    // 2) sentinel -> NaN, dropped channel removed
    let mut rows: Vec<RawRecord> = unique
        .into_iter()
        .map(|r| {
            let readings = Channel::ALL
                .iter()
                .filter(|&&c| c != Channel::DROPPED)
                .map(|&c| {
                    let v = r.reading(c);
                    (c, if v == SENTINEL_MISSING { f64::NAN } else { v })
                })
                .collect();
            RawRecord {
                date: r.date.clone(),
                time: r.time.clone(),
                readings,
            }
        })
        .collect();

    // 3) mean imputation per channel
    for channel in Channel::ALL.into_iter().filter(|&c| c != Channel::DROPPED) {
        let (sum, count) = rows
            .iter()
            .map(|r| r.reading(channel))
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        if count == rows.len() {
            continue;
        }
        let mean = if count > 0 { sum / count as f64 } else { f64::NAN };
        let mut filled = 0;
        for r in rows.iter_mut() {
            if let Some(v) = r.readings.get_mut(&channel) {
                if v.is_nan() {
                    *v = mean;
                    filled += 1;
                }
            }
        }
        debug!(%channel, mean, filled, "imputed channel");
        report.imputed.insert(channel, (mean, filled));
    }

    // 4) anything still missing (all-empty channel, bad date/time) drops the row
    let cleaned: Vec<CleanedRecord> = rows.into_iter().filter_map(finish_row).collect();
    report.rows_dropped = records.len() - report.duplicates_removed - cleaned.len();

    info!(
        input = report.input_rows,
        duplicates = report.duplicates_removed,
        dropped = report.rows_dropped,
        kept = cleaned.len(),
        "cleaned records"
    );
    (cleaned, report)
}

fn finish_row(r: RawRecord) -> Option<CleanedRecord> {
    if r.readings.values().any(|v| !v.is_finite()) {
        return None;
    }
    let date = temporal::parse_date(r.date.as_deref()?).ok()?;
    let hour = temporal::parse_hour(r.time.as_deref()?).ok()?;
    Some(CleanedRecord {
        date,
        hour,
        readings: r.readings,
    })
}
