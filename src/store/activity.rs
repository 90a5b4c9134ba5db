//! Raw activity index per entity.
//!
//! Every applied signal leaves an `ActivityRecord` in the entity's log,
//! kept in event-time order. The batch path reads it for baselines and
//! trends, the context assembler reads it for detail, and reconciliation
//! recounts rule windows from it directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::signals::bus::{MetricFamily, MetricObservation, Polarity, SignalEvent, SignalWeight};
use crate::signals::rules::{CountCondition, WindowCounts};

/// Calendar month key, `(year, month)`.
pub type MonthKey = (i32, u32);

pub fn month_key(at: DateTime<Utc>) -> MonthKey {
    (at.year(), at.month())
}

/// Months between two keys, `to - from`.
pub fn months_between(from: MonthKey, to: MonthKey) -> i64 {
    (to.0 as i64 - from.0 as i64) * 12 + (to.1 as i64 - from.1 as i64)
}

/// Step a month key forward (or back with a negative delta).
pub fn add_months(key: MonthKey, delta: i64) -> MonthKey {
    let idx = key.0 as i64 * 12 + (key.1 as i64 - 1) + delta;
    (idx.div_euclid(12) as i32, (idx.rem_euclid(12) + 1) as u32)
}

/// `at` minus `days`, saturating at the earliest representable time.
pub fn days_before(at: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days)
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Monotonic per store, breaks ties between equal timestamps.
    pub seq: u64,
    pub signal_id: String,
    pub event_type: String,
    pub category: String,
    pub weight: SignalWeight,
    pub polarity: Polarity,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<MetricObservation>,
}

impl ActivityRecord {
    pub fn from_signal(signal: &SignalEvent, seq: u64) -> Self {
        Self {
            seq,
            signal_id: signal.id.clone(),
            event_type: signal.event_type.clone(),
            category: signal.category.clone(),
            weight: signal.weight,
            polarity: signal.polarity,
            occurred_at: signal.occurred_at,
            payload: signal.payload.clone(),
            observations: signal.observations.clone(),
        }
    }

    pub fn value_of(&self, metric: MetricFamily) -> Option<f64> {
        self.observations
            .iter()
            .find(|o| o.metric == metric)
            .map(|o| o.value)
    }
}

/// Time-ordered activity for one entity.
///
/// Clones share the record buffer; a write while a clone is alive copies it.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    records: Arc<Vec<ActivityRecord>>,
}

impl ActivityLog {
    pub fn from_records(mut records: Vec<ActivityRecord>) -> Self {
        records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then(a.seq.cmp(&b.seq)));
        Self {
            records: Arc::new(records),
        }
    }

    pub fn insert(&mut self, record: ActivityRecord) {
        let pos = self.records.partition_point(|r| {
            (r.occurred_at, r.seq) <= (record.occurred_at, record.seq)
        });
        Arc::make_mut(&mut self.records).insert(pos, record);
    }

    /// Oldest record time, if any.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.records.first().map(|r| r.occurred_at)
    }

    /// Drop records older than `cutoff`, returning them.
    pub fn trim_before(&mut self, cutoff: DateTime<Utc>) -> Vec<ActivityRecord> {
        let stale = self.records.partition_point(|r| r.occurred_at < cutoff);
        if stale == 0 {
            return Vec::new();
        }
        Arc::make_mut(&mut self.records).drain(..stale).collect()
    }

    pub fn contains_signal(&self, signal_id: &str) -> bool {
        self.records.iter().any(|r| r.signal_id == signal_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ActivityRecord] {
        self.records.as_slice()
    }

    /// Records with `from <= occurred_at <= to`.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> &[ActivityRecord] {
        let start = self.records.partition_point(|r| r.occurred_at < from);
        let end = self.records.partition_point(|r| r.occurred_at <= to);
        if start >= end {
            &[]
        } else {
            &self.records[start..end]
        }
    }

    pub fn last_in_category(&self, category: &str) -> Option<&ActivityRecord> {
        self.records.iter().rev().find(|r| r.category == category)
    }

    /// `(occurred_at, value)` samples of a metric, in time order.
    pub fn observations(&self, metric: MetricFamily) -> Vec<(DateTime<Utc>, f64)> {
        self.records
            .iter()
            .filter_map(|r| r.value_of(metric).map(|v| (r.occurred_at, v)))
            .collect()
    }

    /// Count of records carrying `metric`, bucketed by calendar month.
    pub fn monthly_event_counts(&self, metric: MetricFamily) -> BTreeMap<MonthKey, f64> {
        let mut buckets = BTreeMap::new();
        for r in self.records.iter() {
            if r.value_of(metric).is_some() {
                *buckets.entry(month_key(r.occurred_at)).or_insert(0.0) += 1.0;
            }
        }
        buckets
    }

    /// Mean metric value per calendar month.
    pub fn monthly_means(&self, metric: MetricFamily) -> BTreeMap<MonthKey, f64> {
        let mut sums: BTreeMap<MonthKey, (f64, u32)> = BTreeMap::new();
        for r in self.records.iter() {
            if let Some(v) = r.value_of(metric) {
                let e = sums.entry(month_key(r.occurred_at)).or_insert((0.0, 0));
                e.0 += v;
                e.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(k, (sum, n))| (k, sum / n as f64))
            .collect()
    }

    /// Activity per category in `[from, to]`.
    pub fn counts_by_category(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for r in self.range(from, to) {
            *counts.entry(r.category.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl WindowCounts for ActivityLog {
    fn count_in_window(&self, condition: &CountCondition, as_of: DateTime<Utc>) -> u64 {
        self.range(condition.window_start(as_of), as_of)
            .iter()
            .filter(|r| r.category == condition.category && condition.admits(r.weight, r.polarity))
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(days: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap() + Duration::days(days)
    }

    fn record(seq: u64, days: i64, category: &str, polarity: Polarity) -> ActivityRecord {
        ActivityRecord {
            seq,
            signal_id: format!("sig-{}", seq),
            event_type: "e".to_string(),
            category: category.to_string(),
            weight: SignalWeight::Moderate,
            polarity,
            occurred_at: at(days),
            payload: serde_json::Value::Null,
            observations: vec![MetricObservation {
                metric: MetricFamily::PaymentTiming,
                value: days as f64,
            }],
        }
    }

    #[test]
    fn test_insert_keeps_time_order() {
        let mut log = ActivityLog::default();
        log.insert(record(1, 10, "financial", Polarity::Negative));
        log.insert(record(2, 5, "financial", Polarity::Negative));
        log.insert(record(3, 10, "maintenance", Polarity::Neutral));
        let seqs: Vec<u64> = log.records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 1, 3]);
    }

    #[test]
    fn test_range_is_inclusive() {
        let log = ActivityLog::from_records(vec![
            record(1, 0, "financial", Polarity::Negative),
            record(2, 10, "financial", Polarity::Negative),
            record(3, 20, "financial", Polarity::Negative),
        ]);
        assert_eq!(log.range(at(0), at(10)).len(), 2);
        assert_eq!(log.range(at(11), at(19)).len(), 0);
        assert_eq!(log.range(at(30), at(10)).len(), 0);
    }

    #[test]
    fn test_window_recount_filters_category_and_polarity() {
        let log = ActivityLog::from_records(vec![
            record(1, 0, "financial", Polarity::Negative),
            record(2, 10, "financial", Polarity::Positive),
            record(3, 20, "maintenance", Polarity::Negative),
            record(4, 30, "financial", Polarity::Negative),
        ]);
        let cond = CountCondition {
            category: "financial".to_string(),
            polarity: Some(Polarity::Negative),
            min_weight: None,
            count: 2,
            window_days: 30,
        };
        assert_eq!(log.count_in_window(&cond, at(30)), 2);
        assert_eq!(log.count_in_window(&cond, at(31)), 1);
    }

    #[test]
    fn test_monthly_buckets() {
        let log = ActivityLog::from_records(vec![
            record(1, 0, "financial", Polarity::Negative),
            record(2, 2, "financial", Polarity::Negative),
            record(3, 31, "financial", Polarity::Negative),
        ]);
        let counts = log.monthly_event_counts(MetricFamily::PaymentTiming);
        assert_eq!(counts.get(&(2025, 1)), Some(&2.0));
        assert_eq!(counts.get(&(2025, 2)), Some(&1.0));
        let means = log.monthly_means(MetricFamily::PaymentTiming);
        assert_eq!(means.get(&(2025, 1)), Some(&1.0));
    }

    #[test]
    fn test_trim_drops_only_older_records() {
        let mut log = ActivityLog::from_records(vec![
            record(1, 0, "financial", Polarity::Negative),
            record(2, 10, "financial", Polarity::Negative),
            record(3, 20, "financial", Polarity::Negative),
        ]);
        let shared = log.clone();
        let dropped = log.trim_before(at(10));
        assert_eq!(dropped.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1]);
        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest(), Some(at(10)));
        assert_eq!(shared.len(), 3, "earlier clones keep their view");
        assert!(log.trim_before(at(10)).is_empty());
    }

    #[test]
    fn test_days_before_saturates() {
        assert_eq!(days_before(at(10), 10), at(0));
        assert_eq!(days_before(at(0), i64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(days_before(DateTime::<Utc>::MIN_UTC, 1), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_month_arithmetic() {
        assert_eq!(add_months((2025, 11), 3), (2026, 2));
        assert_eq!(add_months((2025, 1), -1), (2024, 12));
        assert_eq!(months_between((2024, 12), (2026, 2)), 14);
    }
}
