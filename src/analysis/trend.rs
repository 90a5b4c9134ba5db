//! Category trend: OLS slope of the monthly weighted score.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats;
use crate::store::activity::{add_months, month_key, ActivityLog, MonthKey};
use crate::types::SentimentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
}

impl TrendDirection {
    pub fn from_slope(slope: f64, threshold: f64) -> Self {
        if slope > threshold {
            TrendDirection::Improving
        } else if slope < -threshold {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendFit {
    pub slope: f64,
    pub direction: TrendDirection,
    pub months: usize,
}

/// Weighted score per month for one category, zero-filled from the first
/// active month through the month of `as_of`, limited to `window_months`.
pub fn monthly_scores(
    activity: &ActivityLog,
    category: &str,
    config: &SentimentConfig,
    as_of: DateTime<Utc>,
    window_months: u32,
) -> Vec<(MonthKey, f64)> {
    let mut buckets: BTreeMap<MonthKey, f64> = BTreeMap::new();
    for r in activity.records() {
        if r.category != category || r.occurred_at > as_of {
            continue;
        }
        *buckets.entry(month_key(r.occurred_at)).or_insert(0.0) += config
            .weight_values
            .value(r.weight)
            * config.polarity_multipliers.multiplier(r.polarity);
    }
    let Some(first) = buckets.keys().next().copied() else {
        return Vec::new();
    };
    let last = month_key(as_of);
    let mut month = add_months(last, -(window_months as i64) + 1).max(first);
    let mut series = Vec::new();
    while month <= last {
        series.push((month, buckets.get(&month).copied().unwrap_or(0.0)));
        month = add_months(month, 1);
    }
    series
}

/// Fit a trend, withheld when the series is shorter than `min_months`.
pub fn fit(series: &[f64], min_months: usize, slope_threshold: f64) -> Option<TrendFit> {
    if series.len() < min_months.max(2) {
        return None;
    }
    let (slope, _) = stats::ols(series)?;
    Some(TrendFit {
        slope,
        direction: TrendDirection::from_slope(slope, slope_threshold),
        months: series.len(),
    })
}
