// Calendar derivation and sine/cosine encoding of periodic time quantities.
use std::f64::consts::PI;

use chrono::{Datelike, NaiveDate};

use crate::error::{PipelineError, Result};

pub const HOUR_PERIOD: f64 = 24.0;
pub const MONTH_PERIOD: f64 = 12.0;
/// Weekday runs 0..=6, so seven distinct values share the circle.
pub const WEEKDAY_PERIOD: f64 = 7.0;

/// Day format of the raw export, e.g. `10/03/2004`.
pub const DATE_FORMAT: &str = "%d/%m/%Y";

/// Everything the feature vector needs from a (date, hour) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalFeatures {
    pub year: i32,
    /// 1..=366
    pub day_of_year: u32,
    /// 1..=12
    pub month: u32,
    /// 0 = Monday .. 6 = Sunday
    pub weekday: u32,
    pub hour: u32,
    pub hour_sin: f64,
    pub hour_cos: f64,
    pub month_sin: f64,
    pub month_cos: f64,
    pub weekday_sin: f64,
    pub weekday_cos: f64,
}

/// `(sin(2πv/period), cos(2πv/period))`
pub fn cyclical(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}

pub fn encode(date: NaiveDate, hour: u32) -> Result<TemporalFeatures> {
    if hour > 23 {
        return Err(PipelineError::InvalidTemporalInput(format!(
            "hour {hour} outside [0, 23]"
        )));
    }
    let month = date.month();
    let weekday = date.weekday().num_days_from_monday();
    let (hour_sin, hour_cos) = cyclical(hour as f64, HOUR_PERIOD);
    let (month_sin, month_cos) = cyclical(month as f64, MONTH_PERIOD);
    let (weekday_sin, weekday_cos) = cyclical(weekday as f64, WEEKDAY_PERIOD);

    Ok(TemporalFeatures {
        year: date.year(),
        day_of_year: date.ordinal(),
        month,
        weekday,
        hour,
        hour_sin,
        hour_cos,
        month_sin,
        month_cos,
        weekday_sin,
        weekday_cos,
    })
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| PipelineError::InvalidTemporalInput(format!("date {s:?}: {e}")))
}

/// Hour is the text before the first `.` of `HH.MM.SS`; a bare `HH` also works.
pub fn parse_hour(s: &str) -> Result<u32> {
    let head = s.trim().split('.').next().unwrap_or_default();
    let hour: u32 = head
        .parse()
        .map_err(|_| PipelineError::InvalidTemporalInput(format!("time {s:?}")))?;
    if hour > 23 {
        return Err(PipelineError::InvalidTemporalInput(format!(
            "hour {hour} outside [0, 23]"
        )));
    }
    Ok(hour)
}
