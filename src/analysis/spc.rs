//! Property-level statistical process control.
//!
//! Each property gets a Shewhart chart per metric: the monthly series of
//! the last complete month is compared against mean ± kσ over the twelve
//! months before it. Breaches become property-level anomalies. A second
//! pass compares sub-units (buildings, floors) against their property to
//! flag problems concentrated in one place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats;
use crate::entity::EntityProfile;
use crate::signals::bus::{MetricFamily, MetricKind};
use crate::store::activity::{add_months, month_key, ActivityLog, MonthKey};
use crate::store::summary::{AnomalyFlag, AnomalySource};
use crate::types::AnalysisConfig;

const CHART_BASELINE_MONTHS: i64 = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlChart {
    pub property_id: String,
    pub metric: MetricFamily,
    pub center: f64,
    pub sigma: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub baseline_months: usize,
    pub point_month: MonthKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_value: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

impl ControlChart {
    pub fn out_of_control(&self) -> bool {
        match self.point_value {
            Some(v) if self.upper_limit > self.lower_limit => {
                v > self.upper_limit || v < self.lower_limit
            }
            Some(v) => v != self.center,
            None => false,
        }
    }
}

/// A member of a property with its activity snapshot.
pub type Member<'a> = (&'a EntityProfile, &'a ActivityLog);

/// Property-wide monthly series: summed counts for rate metrics (zero-filled),
/// mean sample value for level metrics (months without samples absent).
pub fn property_series(
    members: &[Member<'_>],
    metric: MetricFamily,
    through: MonthKey,
) -> BTreeMap<MonthKey, f64> {
    match metric.kind() {
        MetricKind::Rate => {
            let mut totals: BTreeMap<MonthKey, f64> = BTreeMap::new();
            for (_, log) in members {
                for (month, count) in log.monthly_event_counts(metric) {
                    *totals.entry(month).or_insert(0.0) += count;
                }
            }
            let Some(first) = totals.keys().next().copied() else {
                return totals;
            };
            let mut month = first;
            while month <= through {
                totals.entry(month).or_insert(0.0);
                month = add_months(month, 1);
            }
            totals
        }
        MetricKind::Level => {
            let mut sums: BTreeMap<MonthKey, (f64, u32)> = BTreeMap::new();
            for (_, log) in members {
                for (at, value) in log.observations(metric) {
                    let e = sums.entry(month_key(at)).or_insert((0.0, 0));
                    e.0 += value;
                    e.1 += 1;
                }
            }
            sums.into_iter()
                .map(|(k, (sum, n))| (k, sum / n as f64))
                .collect()
        }
    }
}

/// Build a chart for one property and metric. Returns the chart and, when
/// the last complete month falls outside the limits, a property anomaly.
pub fn build_chart(
    property_id: &str,
    metric: MetricFamily,
    members: &[Member<'_>],
    as_of: DateTime<Utc>,
    config: &AnalysisConfig,
) -> Option<(ControlChart, Option<AnomalyFlag>)> {
    let point_month = add_months(month_key(as_of), -1);
    let series = property_series(members, metric, point_month);
    let window_start = add_months(point_month, -CHART_BASELINE_MONTHS);
    let baseline: Vec<f64> = series
        .range(window_start..point_month)
        .map(|(_, v)| *v)
        .collect();
    if baseline.len() < config.min_spc_months {
        return None;
    }
    let center = stats::mean(&baseline)?;
    let sigma = stats::std_dev(&baseline)?;
    let floor = config.spread_floor();
    let control_sigma = floor.apply(sigma, center);
    let chart = ControlChart {
        property_id: property_id.to_string(),
        metric,
        center,
        sigma,
        upper_limit: center + config.spc_sigma * control_sigma,
        lower_limit: center - config.spc_sigma * control_sigma,
        baseline_months: baseline.len(),
        point_month,
        point_value: series.get(&point_month).copied(),
        computed_at: as_of,
    };
    let flag = chart
        .point_value
        .filter(|_| chart.out_of_control())
        .and_then(|value| {
            let score = stats::floored_z(value, center, sigma, floor)?;
            Some(AnomalyFlag {
                metric: metric.as_str().to_string(),
                source: AnomalySource::ControlChart,
                score,
                observed: value,
                expected: center,
                description: format!(
                    "{} for {}-{:02} is {:.2}, outside control limits [{:.2}, {:.2}]",
                    metric, point_month.0, point_month.1, value, chart.lower_limit, chart.upper_limit
                ),
                detected_at: as_of,
            })
        });
    Some((chart, flag))
}

/// Sub-units whose per-member event rate in the last complete month is at
/// least `localized_ratio_threshold` times the property's.
pub fn localized_issues(
    property_id: &str,
    metric: MetricFamily,
    members: &[Member<'_>],
    as_of: DateTime<Utc>,
    config: &AnalysisConfig,
) -> Vec<AnomalyFlag> {
    if metric.kind() != MetricKind::Rate || members.is_empty() {
        return Vec::new();
    }
    let month = add_months(month_key(as_of), -1);
    let count_in_month = |log: &ActivityLog| -> f64 {
        log.monthly_event_counts(metric)
            .get(&month)
            .copied()
            .unwrap_or(0.0)
    };

    let mut property_total = 0.0;
    let mut by_sub_unit: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for (profile, log) in members {
        let n = count_in_month(log);
        property_total += n;
        if let Some(sub) = profile.sub_unit.as_deref() {
            let e = by_sub_unit.entry(sub).or_insert((0.0, 0));
            e.0 += n;
            e.1 += 1;
        }
    }
    let property_rate = property_total / members.len() as f64;
    if property_rate <= 0.0 {
        return Vec::new();
    }

    by_sub_unit
        .into_iter()
        .filter_map(|(sub, (count, size))| {
            let rate = count / size as f64;
            let ratio = rate / property_rate;
            if ratio >= config.localized_ratio_threshold
                && count >= config.min_localized_events as f64
            {
                Some(AnomalyFlag {
                    metric: metric.as_str().to_string(),
                    source: AnomalySource::Localized,
                    score: ratio,
                    observed: rate,
                    expected: property_rate,
                    description: format!(
                        "{} in {} / {} is {:.1}x the property rate ({:.0} events)",
                        metric, property_id, sub, ratio, count
                    ),
                    detected_at: as_of,
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityRef, EntityType};
    use crate::signals::bus::{MetricObservation, Polarity, SignalWeight};
    use crate::store::activity::ActivityRecord;
    use chrono::{Duration, TimeZone};

    fn work_orders(start_seq: u64, year: i32, month: u32, n: u32) -> Vec<ActivityRecord> {
        (0..n)
            .map(|i| ActivityRecord {
                seq: start_seq + i as u64,
                signal_id: format!("wo-{}-{}-{}", year, month, i),
                event_type: "work_order_opened".to_string(),
                category: "maintenance".to_string(),
                weight: SignalWeight::Moderate,
                polarity: Polarity::Neutral,
                occurred_at: Utc.with_ymd_and_hms(year, month, 2, 0, 0, 0).unwrap()
                    + Duration::hours(i as i64),
                payload: serde_json::Value::Null,
                observations: vec![MetricObservation {
                    metric: MetricFamily::MaintenanceRate,
                    value: 1.0,
                }],
            })
            .collect()
    }

    fn unit(id: &str, sub: &str) -> EntityProfile {
        EntityProfile::new(EntityRef::new(EntityType::Unit, id))
            .with_property("prop-1")
            .with_sub_unit(sub)
    }

    #[test]
    fn test_spike_breaks_upper_limit() {
        let mut records = Vec::new();
        let monthly = [4, 5, 4, 6, 5, 4, 5, 4, 6, 5, 4, 5];
        for (i, n) in monthly.iter().enumerate() {
            records.extend(work_orders(i as u64 * 100, 2025, i as u32 + 1, *n));
        }
        records.extend(work_orders(5000, 2026, 1, 30));
        let log = ActivityLog::from_records(records);
        let profile = unit("u-1", "bldg-a");
        let members = vec![(&profile, &log)];
        let as_of = Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 0).unwrap();
        let (chart, flag) =
            build_chart("prop-1", MetricFamily::MaintenanceRate, &members, as_of, &AnalysisConfig::default())
                .expect("12 baseline months");
        assert_eq!(chart.baseline_months, 12);
        assert_eq!(chart.point_value, Some(30.0));
        let flag = flag.expect("30 is far above the limit");
        assert_eq!(flag.source, AnomalySource::ControlChart);
    }

    #[test]
    fn test_flat_history_scores_against_floor_with_sign() {
        let chart_for = |point: u32| {
            let mut records = Vec::new();
            for m in 1..=12u32 {
                records.extend(work_orders(m as u64 * 100, 2025, m, 5));
            }
            records.extend(work_orders(5000, 2026, 1, point));
            let log = ActivityLog::from_records(records);
            let profile = unit("u-1", "bldg-a");
            let as_of = Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 0).unwrap();
            build_chart(
                "prop-1",
                MetricFamily::MaintenanceRate,
                &[(&profile, &log)],
                as_of,
                &AnalysisConfig::default(),
            )
            .expect("12 baseline months")
        };

        let (chart, flag) = chart_for(6);
        assert_eq!(chart.sigma, 0.0);
        assert!(flag.is_none(), "one order over a flat five stays inside the floored limits");

        let (_, flag) = chart_for(1);
        let flag = flag.expect("four below a flat five is out of control");
        assert_eq!(flag.score, -4.0);
        assert!(flag.is_finite());
    }

    #[test]
    fn test_chart_withheld_with_short_history() {
        let records = (1..=4u32)
            .flat_map(|m| work_orders(m as u64 * 10, 2025, m, 3))
            .collect();
        let log = ActivityLog::from_records(records);
        let profile = unit("u-1", "bldg-a");
        let as_of = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(build_chart(
            "prop-1",
            MetricFamily::MaintenanceRate,
            &[(&profile, &log)],
            as_of,
            &AnalysisConfig::default()
        )
        .is_none());
    }

    #[test]
    fn test_localized_sub_unit() {
        let a1 = unit("u-1", "bldg-a");
        let a2 = unit("u-2", "bldg-a");
        let b1 = unit("u-3", "bldg-b");
        let b2 = unit("u-4", "bldg-b");
        let b3 = unit("u-5", "bldg-b");
        let b4 = unit("u-6", "bldg-b");
        let hot_1 = ActivityLog::from_records(work_orders(0, 2025, 5, 4));
        let hot_2 = ActivityLog::from_records(work_orders(10, 2025, 5, 4));
        let quiet = ActivityLog::from_records(work_orders(20, 2025, 5, 1));
        let members = vec![
            (&a1, &hot_1),
            (&a2, &hot_2),
            (&b1, &quiet),
            (&b2, &quiet),
            (&b3, &quiet),
            (&b4, &quiet),
        ];
        let as_of = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        let flags = localized_issues(
            "prop-1",
            MetricFamily::MaintenanceRate,
            &members,
            as_of,
            &AnalysisConfig::default(),
        );
        // property: 12 events / 6 units = 2; bldg-a: 8 / 2 = 4 -> ratio 2.0
        assert_eq!(flags.len(), 1);
        assert!(flags[0].description.contains("bldg-a"));
        assert!((flags[0].score - 2.0).abs() < 1e-9);
    }
}
