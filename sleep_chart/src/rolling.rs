//! Positional rolling-mean aggregation over a filtered, date-ordered table.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::{SleepKind, SleepRecord};

/// Weekly rolling-mean value rendered as a horizontal segment spanning the
/// seven calendar days ending on a Monday.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeekSegment {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub mean: f64,
}

/// Number of samples approximating one week: 5 business days when weekends
/// are excluded, 7 calendar days otherwise.
pub fn rolling_window(exclude_weekends: bool) -> usize {
    if exclude_weekends {
        5
    } else {
        7
    }
}

/// Rolling mean over the most recent `window` samples at every position.
/// The mean is undefined (`None`) until `window` samples exist.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if window == 0 || i + 1 < window {
                None
            } else {
                let recent = &values[i + 1 - window..=i];
                Some(recent.iter().sum::<f64>() / window as f64)
            }
        })
        .collect()
}

/// Weekly segments for one category.
///
/// The rolling mean is evaluated at every row of the full sequence before
/// the rows are subset to Mondays; the two steps are not interchangeable.
/// A Monday whose rolling mean is still undefined produces no segment.
pub fn monday_segments(
    records: &[SleepRecord],
    kind: SleepKind,
    window: usize,
) -> Vec<WeekSegment> {
    let values: Vec<f64> = records.iter().map(|r| kind.value(r)).collect();
    records
        .iter()
        .zip(rolling_mean(&values, window))
        .filter_map(|(record, mean)| {
            if record.date.weekday() != Weekday::Mon {
                return None;
            }
            let mean = mean?;
            Some(WeekSegment {
                start: record.date - Duration::days(7),
                end: record.date,
                mean,
            })
        })
        .collect()
}

/// Arithmetic mean of one category over the whole table, `None` when empty.
pub fn series_mean(records: &[SleepRecord], kind: SleepKind) -> Option<f64> {
    if records.is_empty() {
        return None;
    }
    let sum: f64 = records.iter().map(|r| kind.value(r)).sum();
    Some(sum / records.len() as f64)
}
