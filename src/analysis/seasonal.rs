//! Seasonal adjustment for monthly rate series.
//!
//! Classical additive decomposition: a 2x12 centered moving average gives
//! the trend, per-calendar-month means of the detrended values give the
//! seasonal indices (normalized to sum to zero), and what remains is the
//! residual. Anomaly checks look at the residual of the latest month only.
//!
//! Entities with less than two years of history borrow the average curve
//! of their cohort peers. With neither, the check is withheld.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stats;
use crate::signals::bus::MetricFamily;
use crate::store::activity::MonthKey;
use crate::store::summary::{AnomalyFlag, AnomalySource};
use crate::types::AnalysisConfig;

const PERIOD: usize = 12;

/// Additive seasonal index per calendar month, January first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeasonalIndices(pub [f64; PERIOD]);

impl SeasonalIndices {
    pub fn for_month(&self, month: u32) -> f64 {
        self.0[(month as usize + PERIOD - 1) % PERIOD]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub indices: SeasonalIndices,
    /// Residuals where the centered trend is defined.
    pub residuals: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonalBasis {
    Local,
    Cohort,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeasonalOutcome {
    Withheld,
    Checked {
        basis: SeasonalBasis,
        residual: f64,
        z: f64,
        flag: Option<AnomalyFlag>,
    },
}

/// Decompose a contiguous monthly series. `None` below the minimum length.
pub fn decompose(series: &[(MonthKey, f64)], min_months: usize) -> Option<Decomposition> {
    let n = series.len();
    if n < min_months.max(2 * PERIOD) {
        return None;
    }
    let half = PERIOD / 2;
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();

    let mut sums = [0.0; PERIOD];
    let mut counts = [0usize; PERIOD];
    let mut detrended: Vec<(usize, f64)> = Vec::with_capacity(n - 2 * half);
    for i in half..n - half {
        let inner: f64 = values[i - half + 1..i + half].iter().sum();
        let trend = (0.5 * values[i - half] + inner + 0.5 * values[i + half]) / PERIOD as f64;
        let slot = (series[i].0 .1 as usize + PERIOD - 1) % PERIOD;
        let d = values[i] - trend;
        sums[slot] += d;
        counts[slot] += 1;
        detrended.push((slot, d));
    }

    let mut indices = [0.0; PERIOD];
    for slot in 0..PERIOD {
        if counts[slot] == 0 {
            return None;
        }
        indices[slot] = sums[slot] / counts[slot] as f64;
    }
    let adjust = indices.iter().sum::<f64>() / PERIOD as f64;
    for idx in indices.iter_mut() {
        *idx -= adjust;
    }

    let residuals = detrended
        .into_iter()
        .map(|(slot, d)| d - indices[slot])
        .collect();
    Some(Decomposition {
        indices: SeasonalIndices(indices),
        residuals,
    })
}

/// Average seasonal curve across peers.
pub fn cohort_curve(peers: &[SeasonalIndices]) -> Option<SeasonalIndices> {
    if peers.is_empty() {
        return None;
    }
    let mut curve = [0.0; PERIOD];
    for p in peers {
        for (c, v) in curve.iter_mut().zip(p.0.iter()) {
            *c += v;
        }
    }
    for c in curve.iter_mut() {
        *c /= peers.len() as f64;
    }
    Some(SeasonalIndices(curve))
}

/// Check the latest month of `series` against its seasonally adjusted level.
pub fn seasonal_anomaly(
    metric: MetricFamily,
    series: &[(MonthKey, f64)],
    cohort: Option<&SeasonalIndices>,
    as_of: DateTime<Utc>,
    config: &AnalysisConfig,
) -> SeasonalOutcome {
    let Some(((_, latest_month), latest)) = series.last().copied() else {
        return SeasonalOutcome::Withheld;
    };
    let history = &series[..series.len() - 1];

    let (basis, indices, spread) = match decompose(series, config.min_seasonal_months) {
        Some(d) => (SeasonalBasis::Local, d.indices, stats::std_dev(&d.residuals)),
        None => {
            let Some(curve) = cohort else {
                return SeasonalOutcome::Withheld;
            };
            if history.len() < config.min_baseline_observations {
                return SeasonalOutcome::Withheld;
            }
            let adjusted: Vec<f64> = history
                .iter()
                .map(|((_, m), v)| v - curve.for_month(*m))
                .collect();
            (SeasonalBasis::Cohort, *curve, stats::std_dev(&adjusted))
        }
    };
    let Some(spread) = spread else {
        return SeasonalOutcome::Withheld;
    };

    let recent: Vec<f64> = history
        .iter()
        .rev()
        .take(PERIOD)
        .map(|((_, m), v)| v - indices.for_month(*m))
        .collect();
    let Some(level) = stats::mean(&recent) else {
        return SeasonalOutcome::Withheld;
    };
    let expected = level + indices.for_month(latest_month);
    let residual = latest - expected;
    let Some(z) = stats::floored_z(latest, expected, spread, config.spread_floor()) else {
        return SeasonalOutcome::Withheld;
    };

    let flag = (z.abs() > config.anomaly_z_threshold).then(|| AnomalyFlag {
        metric: metric.as_str().to_string(),
        source: AnomalySource::Seasonal,
        score: z,
        observed: latest,
        expected,
        description: format!(
            "{} of {:.1} vs seasonally expected {:.1} (residual z={:.2}, {} curve)",
            metric,
            latest,
            expected,
            z,
            match basis {
                SeasonalBasis::Local => "local",
                SeasonalBasis::Cohort => "cohort",
            }
        ),
        detected_at: as_of,
    });
    SeasonalOutcome::Checked {
        basis,
        residual,
        z,
        flag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::activity::add_months;
    use chrono::TimeZone;

    /// Summer-peaking series with a small alternating wobble.
    fn seasonal_series(months: usize) -> Vec<(MonthKey, f64)> {
        let shape = [2.0, 2.0, 3.0, 4.0, 6.0, 9.0, 10.0, 9.0, 6.0, 4.0, 3.0, 2.0];
        (0..months)
            .map(|i| {
                let key = add_months((2023, 1), i as i64);
                let wobble = if i % 2 == 0 { 0.3 } else { -0.3 };
                (key, shape[(key.1 - 1) as usize] + wobble)
            })
            .collect()
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_decomposition_recovers_seasonal_shape() {
        let d = decompose(&seasonal_series(36), 24).expect("36 months");
        assert!(d.indices.for_month(7) > 3.0, "July peak");
        assert!(d.indices.for_month(1) < -2.0, "January trough");
        let sum: f64 = d.indices.0.iter().sum();
        assert!(sum.abs() < 1e-9);
    }

    #[test]
    fn test_decomposition_withheld_under_24_months() {
        assert!(decompose(&seasonal_series(23), 24).is_none());
    }

    #[test]
    fn test_summer_peak_is_not_anomalous() {
        let series = seasonal_series(31); // ends July 2025
        let outcome = seasonal_anomaly(
            MetricFamily::MaintenanceRate,
            &series,
            None,
            as_of(),
            &AnalysisConfig::default(),
        );
        match outcome {
            SeasonalOutcome::Checked { basis, flag, .. } => {
                assert_eq!(basis, SeasonalBasis::Local);
                assert!(flag.is_none(), "the raw peak is expected for July");
            }
            other => panic!("expected a local check, got {:?}", other),
        }
    }

    #[test]
    fn test_off_season_spike_is_anomalous() {
        let mut series = seasonal_series(36); // ends Dec 2025
        let last = series.len() - 1;
        series[last].1 = 12.0;
        let outcome = seasonal_anomaly(
            MetricFamily::MaintenanceRate,
            &series,
            None,
            as_of(),
            &AnalysisConfig::default(),
        );
        match outcome {
            SeasonalOutcome::Checked { flag, z, .. } => {
                assert!(z > 2.0);
                assert_eq!(flag.expect("flag").source, AnomalySource::Seasonal);
            }
            other => panic!("expected a check, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_series_never_scores_infinite() {
        let flat = |last: f64| {
            let mut series: Vec<(MonthKey, f64)> =
                (0..36).map(|i| (add_months((2023, 1), i), 5.0)).collect();
            series[35].1 = last;
            seasonal_anomaly(
                MetricFamily::MaintenanceRate,
                &series,
                None,
                as_of(),
                &AnalysisConfig::default(),
            )
        };
        match flat(6.0) {
            SeasonalOutcome::Checked { z, flag, .. } => {
                assert!((z - 1.0).abs() < 0.05, "z={}", z);
                assert!(flag.is_none());
            }
            other => panic!("expected a check, got {:?}", other),
        }
        match flat(1.0) {
            SeasonalOutcome::Checked { z, flag, .. } => {
                assert!((z + 4.0).abs() < 0.05, "z={}", z);
                assert!(flag.expect("drop below a flat level").is_finite());
            }
            other => panic!("expected a check, got {:?}", other),
        }
    }

    #[test]
    fn test_short_history_uses_cohort_curve_or_withholds() {
        let series = seasonal_series(10);
        let config = AnalysisConfig::default();
        assert_eq!(
            seasonal_anomaly(MetricFamily::MaintenanceRate, &series, None, as_of(), &config),
            SeasonalOutcome::Withheld
        );
        let peer = decompose(&seasonal_series(36), 24).expect("peer").indices;
        let curve = cohort_curve(&[peer]).expect("curve");
        match seasonal_anomaly(MetricFamily::MaintenanceRate, &series, Some(&curve), as_of(), &config) {
            SeasonalOutcome::Checked { basis, .. } => assert_eq!(basis, SeasonalBasis::Cohort),
            other => panic!("expected a cohort check, got {:?}", other),
        }
    }
}
