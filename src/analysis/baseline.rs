//! Per-entity robust baselines and deviation checks.
//!
//! A baseline is the median and MAD of one metric family over a trailing
//! window. Level metrics (payment timing, amount) use individual samples;
//! rate metrics (maintenance, responsiveness) use monthly event counts.
//! Baselines are replaced wholesale each cycle and are absent until the
//! minimum observation count is met.
//!
//! The event-time check reads whatever baseline the last cycle produced,
//! so between cycles it runs against a baseline up to one cycle old.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::stats::{self, SpreadFloor, MAD_SCALE};
use crate::entity::EntityRef;
use crate::signals::bus::{MetricFamily, MetricKind, SignalEvent};
use crate::store::activity::{add_months, month_key, ActivityLog, MonthKey};
use crate::store::summary::{AnomalyFlag, AnomalySource};
use crate::types::AnalysisConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub entity: EntityRef,
    pub metric: MetricFamily,
    pub median: f64,
    pub mad: f64,
    pub scaled_mad: f64,
    pub observations: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

impl Baseline {
    /// Distance from the median in floored scaled-MAD units.
    pub fn z_score(&self, value: f64, floor: SpreadFloor) -> Option<f64> {
        stats::floored_z(value, self.median, self.scaled_mad, floor).map(f64::abs)
    }
}

fn window_start(as_of: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    as_of
        .checked_sub_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Monthly counts for the complete months inside the window, zero-filled
/// from the entity's first month of activity for this metric.
pub fn monthly_rate_series(
    activity: &ActivityLog,
    metric: MetricFamily,
    as_of: DateTime<Utc>,
    months: u32,
) -> Vec<(MonthKey, f64)> {
    let counts = activity.monthly_event_counts(metric);
    let Some(first) = counts.keys().next().copied() else {
        return Vec::new();
    };
    let last_complete = add_months(month_key(as_of), -1);
    let mut month = add_months(month_key(as_of), -(months as i64));
    if month < first {
        month = first;
    }
    let mut series = Vec::new();
    while month <= last_complete {
        series.push((month, counts.get(&month).copied().unwrap_or(0.0)));
        month = add_months(month, 1);
    }
    series
}

/// Compute one baseline, or `None` when fewer than the minimum observations exist.
pub fn compute_baseline(
    entity: &EntityRef,
    metric: MetricFamily,
    activity: &ActivityLog,
    as_of: DateTime<Utc>,
    config: &AnalysisConfig,
) -> Option<Baseline> {
    let start = window_start(as_of, config.baseline_window_months);
    let values: Vec<f64> = match metric.kind() {
        MetricKind::Level => activity
            .observations(metric)
            .into_iter()
            .filter(|(t, _)| *t >= start && *t <= as_of)
            .map(|(_, v)| v)
            .collect(),
        MetricKind::Rate => {
            monthly_rate_series(activity, metric, as_of, config.baseline_window_months)
                .into_iter()
                .map(|(_, v)| v)
                .collect()
        }
    };
    if values.len() < config.min_baseline_observations {
        return None;
    }
    let median = stats::median(&values)?;
    let mad = stats::mad(&values)?;
    Some(Baseline {
        entity: entity.clone(),
        metric,
        median,
        mad,
        scaled_mad: mad * MAD_SCALE,
        observations: values.len(),
        window_start: start,
        window_end: as_of,
        computed_at: as_of,
    })
}

/// Every baseline an entity currently qualifies for.
pub fn compute_all(
    entity: &EntityRef,
    activity: &ActivityLog,
    as_of: DateTime<Utc>,
    config: &AnalysisConfig,
) -> Vec<Baseline> {
    MetricFamily::ALL
        .iter()
        .filter_map(|m| compute_baseline(entity, *m, activity, as_of, config))
        .collect()
}

/// Level check: flag when the robust z-score exceeds the threshold.
pub fn level_anomaly(
    baseline: &Baseline,
    value: f64,
    config: &AnalysisConfig,
    at: DateTime<Utc>,
    source: AnomalySource,
) -> Option<AnomalyFlag> {
    let z = baseline.z_score(value, config.spread_floor())?;
    if z <= config.anomaly_z_threshold {
        return None;
    }
    Some(AnomalyFlag {
        metric: baseline.metric.as_str().to_string(),
        source,
        score: z,
        observed: value,
        expected: baseline.median,
        description: format!(
            "{} of {:.2} deviates from baseline median {:.2} (z={:.2}, baseline from {})",
            baseline.metric,
            value,
            baseline.median,
            z,
            baseline.computed_at.format("%Y-%m-%d")
        ),
        detected_at: at,
    })
}

/// Rate check: trailing 30-day count against the baseline monthly median.
pub fn rate_anomaly(
    baseline: &Baseline,
    activity: &ActivityLog,
    as_of: DateTime<Utc>,
    ratio_threshold: f64,
) -> Option<AnomalyFlag> {
    if baseline.median <= 0.0 {
        return None;
    }
    let current = activity
        .range(as_of - Duration::days(30), as_of)
        .iter()
        .filter(|r| r.value_of(baseline.metric).is_some())
        .count() as f64;
    let ratio = current / baseline.median;
    if ratio >= ratio_threshold {
        return None;
    }
    Some(AnomalyFlag {
        metric: baseline.metric.as_str().to_string(),
        source: AnomalySource::Baseline,
        score: ratio,
        observed: current,
        expected: baseline.median,
        description: format!(
            "{} dropped to {:.0} in the last 30 days vs a monthly median of {:.1} ({:.0}% of baseline)",
            baseline.metric,
            current,
            baseline.median,
            ratio * 100.0
        ),
        detected_at: as_of,
    })
}

// ---------------------------------------------------------------------------
// Baseline store
// ---------------------------------------------------------------------------

/// Run a synchronous anomaly check for a freshly classified signal.
pub trait EventAnomalyCheck: Send + Sync {
    fn check(&self, entity: &EntityRef, signal: &SignalEvent) -> Vec<AnomalyFlag>;
}

/// Current baselines by entity. Each entity's set is swapped as a unit.
#[derive(Debug)]
pub struct BaselineStore {
    by_entity: DashMap<EntityRef, Arc<BTreeMap<MetricFamily, Baseline>>>,
    config: AnalysisConfig,
}

impl BaselineStore {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            by_entity: DashMap::new(),
            config: config.clone(),
        }
    }

    /// Replace an entity's baselines. An empty set removes them.
    pub fn replace(&self, entity: &EntityRef, baselines: Vec<Baseline>) {
        if baselines.is_empty() {
            self.by_entity.remove(entity);
            return;
        }
        let map: BTreeMap<MetricFamily, Baseline> =
            baselines.into_iter().map(|b| (b.metric, b)).collect();
        self.by_entity.insert(entity.clone(), Arc::new(map));
    }

    pub fn get(&self, entity: &EntityRef, metric: MetricFamily) -> Option<Baseline> {
        self.by_entity
            .get(entity)
            .and_then(|m| m.get(&metric).cloned())
    }

    pub fn for_entity(&self, entity: &EntityRef) -> Vec<Baseline> {
        self.by_entity
            .get(entity)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_entity.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    /// Load persisted baselines, grouped per entity.
    pub fn restore(&self, baselines: Vec<Baseline>) {
        let mut grouped: BTreeMap<EntityRef, Vec<Baseline>> = BTreeMap::new();
        for b in baselines {
            grouped.entry(b.entity.clone()).or_default().push(b);
        }
        for (entity, set) in grouped {
            self.replace(&entity, set);
        }
    }
}

impl EventAnomalyCheck for BaselineStore {
    fn check(&self, entity: &EntityRef, signal: &SignalEvent) -> Vec<AnomalyFlag> {
        signal
            .observations
            .iter()
            .filter(|o| o.metric.kind() == MetricKind::Level)
            .filter_map(|o| {
                let baseline = self.get(entity, o.metric)?;
                level_anomaly(
                    &baseline,
                    o.value,
                    &self.config,
                    signal.occurred_at,
                    AnomalySource::EventTime,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::signals::bus::{MetricObservation, Polarity, SignalWeight};
    use crate::store::activity::ActivityRecord;
    use chrono::TimeZone;

    fn person() -> EntityRef {
        EntityRef::new(EntityType::Person, "p-1")
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap()
    }

    fn payment(seq: u64, months_ago: u32, days_late: f64) -> ActivityRecord {
        ActivityRecord {
            seq,
            signal_id: format!("sig-{}", seq),
            event_type: "rent_payment".to_string(),
            category: "financial".to_string(),
            weight: SignalWeight::Weak,
            polarity: Polarity::Positive,
            occurred_at: as_of().checked_sub_months(Months::new(months_ago)).unwrap(),
            payload: serde_json::Value::Null,
            observations: vec![MetricObservation {
                metric: MetricFamily::PaymentTiming,
                value: days_late,
            }],
        }
    }

    fn work_order(seq: u64, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            seq,
            signal_id: format!("wo-{}", seq),
            event_type: "work_order_opened".to_string(),
            category: "maintenance".to_string(),
            weight: SignalWeight::Moderate,
            polarity: Polarity::Neutral,
            occurred_at: at,
            payload: serde_json::Value::Null,
            observations: vec![MetricObservation {
                metric: MetricFamily::MaintenanceRate,
                value: 1.0,
            }],
        }
    }

    #[test]
    fn test_baseline_withheld_until_sixth_observation() {
        let config = AnalysisConfig::default();
        let mut log = ActivityLog::default();
        for i in 0..5u64 {
            log.insert(payment(i, 5 - i as u32, 1.0));
        }
        assert!(
            compute_baseline(&person(), MetricFamily::PaymentTiming, &log, as_of(), &config).is_none(),
            "5 observations must not produce a baseline"
        );
        log.insert(payment(5, 0, 2.0));
        let baseline = compute_baseline(&person(), MetricFamily::PaymentTiming, &log, as_of(), &config)
            .expect("6th observation produces a baseline");
        assert_eq!(baseline.observations, 6);
        assert_eq!(baseline.median, 1.0);
    }

    #[test]
    fn test_observations_outside_window_ignored() {
        let config = AnalysisConfig::default();
        let mut log = ActivityLog::default();
        for i in 0..6u64 {
            log.insert(payment(i, 13 + i as u32, 1.0));
        }
        assert!(compute_all(&person(), &log, as_of(), &config).is_empty());
    }

    #[test]
    fn test_level_anomaly_threshold() {
        let baseline = Baseline {
            entity: person(),
            metric: MetricFamily::PaymentTiming,
            median: 2.0,
            mad: 1.0,
            scaled_mad: MAD_SCALE,
            observations: 12,
            window_start: as_of(),
            window_end: as_of(),
            computed_at: as_of(),
        };
        let config = AnalysisConfig::default();
        assert!(level_anomaly(&baseline, 4.0, &config, as_of(), AnomalySource::EventTime).is_none());
        let flag = level_anomaly(&baseline, 14.0, &config, as_of(), AnomalySource::EventTime)
            .expect("12 days off a median of 2 is anomalous");
        assert!(flag.score > 8.0);
        assert_eq!(flag.metric, "payment_timing");
    }

    #[test]
    fn test_constant_history_measured_against_spread_floor() {
        let config = AnalysisConfig::default();
        let mut log = ActivityLog::default();
        for i in 0..8u64 {
            log.insert(payment(i, 8 - i as u32, 0.0));
        }
        let store = BaselineStore::new(&config);
        store.replace(&person(), compute_all(&person(), &log, as_of(), &config));
        let baseline = store.get(&person(), MetricFamily::PaymentTiming).expect("baseline");
        assert_eq!(baseline.scaled_mad, 0.0);
        assert!(level_anomaly(&baseline, 0.0, &config, as_of(), AnomalySource::EventTime).is_none());
        assert!(
            level_anomaly(&baseline, 1.0, &config, as_of(), AnomalySource::EventTime).is_none(),
            "one day late after always paying on time is within the floor"
        );
        let flag = level_anomaly(&baseline, 3.0, &config, as_of(), AnomalySource::EventTime)
            .expect("three days late is anomalous");
        assert_eq!(flag.score, 3.0);
        assert!(flag.is_finite());
    }

    #[test]
    fn test_rate_baseline_zero_fills_months() {
        let config = AnalysisConfig::default();
        let mut log = ActivityLog::default();
        let mut seq = 0;
        // 4 per month for 8 months, one quiet month in the middle
        for m in 1..=9u32 {
            if m == 5 {
                continue;
            }
            let month_start = Utc.with_ymd_and_hms(2025, m, 3, 0, 0, 0).unwrap();
            for d in 0..4 {
                seq += 1;
                log.insert(work_order(seq, month_start + Duration::days(d * 5)));
            }
        }
        let as_of = Utc.with_ymd_and_hms(2025, 11, 5, 0, 0, 0).unwrap();
        let baseline = compute_baseline(&person(), MetricFamily::MaintenanceRate, &log, as_of, &config)
            .expect("10 complete months");
        assert_eq!(baseline.observations, 10);
        assert_eq!(baseline.median, 4.0);

        // Nothing in the last 30 days: ratio 0 < 0.3
        let flag = rate_anomaly(&baseline, &log, as_of, config.rate_ratio_threshold).expect("drop");
        assert_eq!(flag.score, 0.0);
        assert_eq!(flag.source, AnomalySource::Baseline);
    }

    #[test]
    fn test_store_replace_is_wholesale() {
        let store = BaselineStore::new(&AnalysisConfig::default());
        let b = Baseline {
            entity: person(),
            metric: MetricFamily::PaymentTiming,
            median: 1.0,
            mad: 0.0,
            scaled_mad: 0.0,
            observations: 6,
            window_start: as_of(),
            window_end: as_of(),
            computed_at: as_of(),
        };
        let mut amount = b.clone();
        amount.metric = MetricFamily::PaymentAmount;
        store.replace(&person(), vec![b.clone(), amount]);
        assert_eq!(store.len(), 2);
        store.replace(&person(), vec![b]);
        assert_eq!(store.len(), 1, "missing metric removed, not kept stale");
        store.replace(&person(), Vec::new());
        assert!(store.is_empty());
    }

    #[test]
    fn test_event_check_only_uses_level_metrics() {
        let store = BaselineStore::new(&AnalysisConfig::default());
        store.replace(
            &person(),
            vec![Baseline {
                entity: person(),
                metric: MetricFamily::PaymentTiming,
                median: 1.0,
                mad: 1.0,
                scaled_mad: MAD_SCALE,
                observations: 6,
                window_start: as_of(),
                window_end: as_of(),
                computed_at: as_of(),
            }],
        );
        let signal = SignalEvent {
            id: "sig-x".to_string(),
            event_type: "rent_payment".to_string(),
            occurred_at: as_of(),
            entity_refs: vec![person()],
            category: "financial".to_string(),
            weight: SignalWeight::Strong,
            polarity: Polarity::Negative,
            payload: serde_json::Value::Null,
            observations: vec![
                MetricObservation {
                    metric: MetricFamily::PaymentTiming,
                    value: 20.0,
                },
                MetricObservation {
                    metric: MetricFamily::MaintenanceRate,
                    value: 1.0,
                },
            ],
        };
        let flags = store.check(&person(), &signal);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].source, AnomalySource::EventTime);
    }
}
