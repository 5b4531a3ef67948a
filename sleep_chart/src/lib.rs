//! Core sleep data loading, filtering and aggregation library.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod rolling;

#[derive(Error, Debug)]
pub enum SleepError {
    #[error("missing required column `{0}`")]
    MissingColumn(String),
    #[error("row {row}: cannot parse {column} value `{value}`")]
    InvalidField {
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// One sleep session as exported by the tracker, durations converted to hours.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SleepRecord {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub deep_h: f64,
    pub shallow_h: f64,
    /// Derived at load time as `deep_h + shallow_h`, never mutated afterwards.
    pub total_h: f64,
}

/// The fixed set of charted sleep-time series, in display order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SleepKind {
    Total,
    Shallow,
    Deep,
}

impl SleepKind {
    pub const ALL: [SleepKind; 3] = [SleepKind::Total, SleepKind::Shallow, SleepKind::Deep];

    pub fn label(&self) -> &'static str {
        match self {
            SleepKind::Total => "Total",
            SleepKind::Shallow => "Shallow",
            SleepKind::Deep => "Deep",
        }
    }

    pub fn color(&self) -> (u8, u8, u8) {
        match self {
            SleepKind::Total => (0x1f, 0x77, 0xb4),
            SleepKind::Shallow => (0xd6, 0x27, 0x28),
            SleepKind::Deep => (0x94, 0x67, 0xbd),
        }
    }

    pub fn value(&self, record: &SleepRecord) -> f64 {
        match self {
            SleepKind::Total => record.total_h,
            SleepKind::Shallow => record.shallow_h,
            SleepKind::Deep => record.deep_h,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FilterParams {
    /// Keep rows with `date` strictly greater than this bound.
    pub after: Option<NaiveDate>,
    /// Keep rows with `date` strictly less than this bound.
    pub before: Option<NaiveDate>,
    pub exclude_weekends: bool,
}

const DATE_COLUMN: &str = "date";
const START_COLUMN: &str = "start";
const STOP_COLUMN: &str = "stop";
const DEEP_COLUMN: &str = "deepSleepTime";
const SHALLOW_COLUMN: &str = "shallowSleepTime";

/// Parse sleep records from raw CSV bytes.
///
/// Required columns are located by header name; any extra columns are
/// ignored. A leading UTF-8 byte-order mark is tolerated. Any malformed
/// field fails the whole load, there is no partial table.
pub fn parse_records(input: &[u8]) -> Result<Vec<SleepRecord>, SleepError> {
    let input = input.strip_prefix(b"\xef\xbb\xbf").unwrap_or(input);
    let mut reader = csv::Reader::from_reader(input);
    let headers = reader.headers()?.clone();
    let required = |name: &str| -> Result<usize, SleepError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| SleepError::MissingColumn(name.to_string()))
    };
    let date_idx = required(DATE_COLUMN)?;
    let start_idx = required(START_COLUMN)?;
    let stop_idx = required(STOP_COLUMN)?;
    let deep_idx = required(DEEP_COLUMN)?;
    let shallow_idx = required(SHALLOW_COLUMN)?;

    let mut records = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result?;
        let field = |idx: usize| record.get(idx).unwrap_or("");

        let date = parse_date(field(date_idx), row, "date")?;
        let start = parse_epoch(field(start_idx), row, "start")?;
        let stop = parse_epoch(field(stop_idx), row, "stop")?;
        // Source durations are minutes; the chart works in hours.
        let deep_h = parse_number(field(deep_idx), row, "deepSleepTime")? / 60.0;
        let shallow_h = parse_number(field(shallow_idx), row, "shallowSleepTime")? / 60.0;

        records.push(SleepRecord {
            date,
            start,
            stop,
            deep_h,
            shallow_h,
            total_h: deep_h + shallow_h,
        });
    }
    Ok(records)
}

fn parse_date(value: &str, row: usize, column: &'static str) -> Result<NaiveDate, SleepError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| SleepError::InvalidField {
        row,
        column,
        value: value.to_string(),
    })
}

fn parse_epoch(value: &str, row: usize, column: &'static str) -> Result<DateTime<Utc>, SleepError> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| SleepError::InvalidField {
            row,
            column,
            value: value.to_string(),
        })
}

fn parse_number(value: &str, row: usize, column: &'static str) -> Result<f64, SleepError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| SleepError::InvalidField {
            row,
            column,
            value: value.to_string(),
        })
}

/// Monday through Friday, using Monday-first weekday numbering.
pub fn is_weekday(date: NaiveDate) -> bool {
    date.weekday().num_days_from_monday() < 5
}

/// Return the rows satisfying all active filter predicates, in input order.
///
/// The predicates are independent: each optional bound applies on its own
/// and they combine with logical AND. An empty result is valid.
pub fn filter_records(records: &[SleepRecord], params: &FilterParams) -> Vec<SleepRecord> {
    records
        .iter()
        .filter(|r| {
            params.after.map_or(true, |after| r.date > after)
                && params.before.map_or(true, |before| r.date < before)
                && (!params.exclude_weekends || is_weekday(r.date))
        })
        .cloned()
        .collect()
}
