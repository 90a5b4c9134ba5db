//! Batch runner for the analysis methods.
//!
//! Triggered externally (see `schedule` for cadences). Each method works from
//! per-entity snapshots on blocking worker threads and writes derived fields
//! back through `SummaryStore::update_derived`, so the event path keeps
//! running during a cycle. A failure for one entity is logged and counted;
//! the rest of the cycle continues.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::absence::evaluate_absence;
use super::baseline::{self, BaselineStore};
use super::seasonal::{self, SeasonalIndices, SeasonalOutcome};
use super::spc::{self, ControlChart, Member};
use super::trend::{self, TrendFit};
use super::{cohort, AnalysisMethod};
use crate::db::SignalDb;
use crate::entity::{EntityRef, EntityType};
use crate::error::{PipelineError, ValidationError};
use crate::signals::bus::{MetricFamily, MetricKind};
use crate::store::activity::MonthKey;
use crate::store::summary::AnomalySource;
use crate::store::{EntitySnapshot, SummaryStore};
use crate::types::AnalysisConfig;

/// How far back seasonal decomposition reads.
pub const SEASONAL_HISTORY_MONTHS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityOutcome {
    Written,
    Withheld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodReport {
    pub method: AnalysisMethod,
    pub processed: usize,
    pub written: usize,
    /// Not enough data; the output field stays absent.
    pub withheld: usize,
    pub failed: usize,
}

impl MethodReport {
    fn new(method: AnalysisMethod) -> Self {
        Self {
            method,
            processed: 0,
            written: 0,
            withheld: 0,
            failed: 0,
        }
    }

    fn record(&mut self, key: &str, result: Result<EntityOutcome, PipelineError>) {
        self.processed += 1;
        match result {
            Ok(EntityOutcome::Written) => self.written += 1,
            Ok(EntityOutcome::Withheld) => self.withheld += 1,
            Err(e) => {
                log::warn!("{} failed for {}: {}", self.method, key, e);
                self.failed += 1;
            }
        }
    }

    fn merge(&mut self, other: MethodReport) {
        self.processed += other.processed;
        self.written += other.written;
        self.withheld += other.withheld;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub as_of: DateTime<Utc>,
    pub methods: Vec<MethodReport>,
}

impl CycleReport {
    pub fn method(&self, method: AnalysisMethod) -> Option<&MethodReport> {
        self.methods.iter().find(|m| m.method == method)
    }
}

#[derive(Clone)]
pub struct AnalysisRunner {
    store: Arc<SummaryStore>,
    baselines: Arc<BaselineStore>,
    charts: Arc<DashMap<String, Vec<ControlChart>>>,
    config: Arc<AnalysisConfig>,
}

impl AnalysisRunner {
    pub fn new(
        store: Arc<SummaryStore>,
        baselines: Arc<BaselineStore>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            store,
            baselines,
            charts: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn baselines(&self) -> &Arc<BaselineStore> {
        &self.baselines
    }

    /// Current control charts for a property.
    pub fn charts_for(&self, property_id: &str) -> Vec<ControlChart> {
        self.charts
            .get(property_id)
            .map(|c| c.value().clone())
            .unwrap_or_default()
    }

    /// Load persisted baselines and control charts.
    pub fn restore(&self, db: &SignalDb) -> Result<(), PipelineError> {
        self.baselines.restore(db.load_baselines()?);
        let mut grouped: BTreeMap<String, Vec<ControlChart>> = BTreeMap::new();
        for chart in db.load_control_charts()? {
            grouped.entry(chart.property_id.clone()).or_default().push(chart);
        }
        for (property_id, charts) in grouped {
            self.charts.insert(property_id, charts);
        }
        Ok(())
    }

    /// Run the requested methods in dependency order.
    pub async fn run_cycle(&self, methods: &[AnalysisMethod], as_of: DateTime<Utc>) -> CycleReport {
        let mut reports = Vec::new();
        for method in AnalysisMethod::ALL {
            if methods.contains(&method) {
                reports.push(self.run_method(method, as_of).await);
            }
        }
        CycleReport {
            as_of,
            methods: reports,
        }
    }

    pub async fn run_method(&self, method: AnalysisMethod, as_of: DateTime<Utc>) -> MethodReport {
        log::info!("analysis: running {} as of {}", method, as_of);
        let report = match method {
            AnalysisMethod::Baselines => {
                self.per_entity(method, as_of, |r, e, at| r.baseline_entity(e, at))
                    .await
            }
            AnalysisMethod::Trends => {
                self.per_entity(method, as_of, |r, e, at| r.trend_entity(e, at))
                    .await
            }
            AnalysisMethod::Absence => {
                self.per_entity(method, as_of, |r, e, at| r.absence_entity(e, at))
                    .await
            }
            AnalysisMethod::ControlCharts => {
                self.blocking(method, move |r| r.run_control_charts(as_of))
                    .await
            }
            AnalysisMethod::Seasonal => self.blocking(method, move |r| r.run_seasonal(as_of)).await,
            AnalysisMethod::Cohorts => self.blocking(method, |r| r.run_cohorts()).await,
        };
        log::info!(
            "analysis: {} processed={} written={} withheld={} failed={}",
            method,
            report.processed,
            report.written,
            report.withheld,
            report.failed
        );
        report
    }

    // -----------------------------------------------------------------------
    // Execution helpers
    // -----------------------------------------------------------------------

    async fn per_entity<F>(&self, method: AnalysisMethod, as_of: DateTime<Utc>, f: F) -> MethodReport
    where
        F: Fn(&AnalysisRunner, &EntityRef, DateTime<Utc>) -> Result<EntityOutcome, PipelineError>
            + Send
            + Sync
            + 'static,
    {
        let f = Arc::new(f);
        let entities = self.store.entities();
        let mut handles = Vec::new();
        for chunk in entities.chunks(self.config.batch_chunk_size.max(1)) {
            let chunk = chunk.to_vec();
            let runner = self.clone();
            let f = f.clone();
            let size = chunk.len();
            let handle = tokio::task::spawn_blocking(move || {
                let mut report = MethodReport::new(method);
                for entity in &chunk {
                    report.record(&entity.to_string(), f(&runner, entity, as_of));
                }
                report
            });
            handles.push((size, handle));
        }

        let mut report = MethodReport::new(method);
        for (size, handle) in handles {
            match handle.await {
                Ok(part) => report.merge(part),
                Err(e) => {
                    log::warn!("{} chunk of {} entities aborted: {}", method, size, e);
                    report.processed += size;
                    report.failed += size;
                }
            }
        }
        report
    }

    async fn blocking<F>(&self, method: AnalysisMethod, f: F) -> MethodReport
    where
        F: FnOnce(&AnalysisRunner) -> MethodReport + Send + 'static,
    {
        let runner = self.clone();
        match tokio::task::spawn_blocking(move || f(&runner)).await {
            Ok(report) => report,
            Err(e) => {
                log::warn!("{} aborted: {}", method, e);
                let mut report = MethodReport::new(method);
                report.failed = 1;
                report
            }
        }
    }

    fn snapshot(&self, entity: &EntityRef) -> Result<EntitySnapshot, PipelineError> {
        self.store
            .snapshot(entity)
            .ok_or_else(|| ValidationError::UnknownEntity(entity.clone()).into())
    }

    // -----------------------------------------------------------------------
    // Per-entity methods
    // -----------------------------------------------------------------------

    fn baseline_entity(
        &self,
        entity: &EntityRef,
        as_of: DateTime<Utc>,
    ) -> Result<EntityOutcome, PipelineError> {
        let snap = self.snapshot(entity)?;
        let computed = baseline::compute_all(entity, &snap.activity, as_of, &self.config);

        let flags: Vec<_> = computed
            .iter()
            .filter(|b| b.metric.kind() == MetricKind::Rate)
            .filter_map(|b| {
                baseline::rate_anomaly(b, &snap.activity, as_of, self.config.rate_ratio_threshold)
            })
            .collect();

        if let Some(db) = self.store.db() {
            db.lock().replace_baselines(entity, &computed)?;
        }
        let outcome = if computed.is_empty() {
            EntityOutcome::Withheld
        } else {
            EntityOutcome::Written
        };
        self.baselines.replace(entity, computed);

        let retention = self.store.anomaly_retention();
        self.store.update_derived(entity, |s| {
            s.replace_anomalies(AnomalySource::Baseline, flags, retention)
        })?;
        Ok(outcome)
    }

    fn trend_entity(
        &self,
        entity: &EntityRef,
        as_of: DateTime<Utc>,
    ) -> Result<EntityOutcome, PipelineError> {
        let snap = self.snapshot(entity)?;
        let sentiment = self.store.sentiment_config();
        let fits: BTreeMap<String, Option<TrendFit>> = snap
            .summary
            .categories
            .keys()
            .map(|category| {
                let series: Vec<f64> = trend::monthly_scores(
                    &snap.activity,
                    category,
                    sentiment,
                    as_of,
                    self.config.baseline_window_months,
                )
                .into_iter()
                .map(|(_, v)| v)
                .collect();
                let fit = trend::fit(
                    &series,
                    self.config.min_trend_months,
                    self.config.trend_slope_threshold,
                );
                (category.clone(), fit)
            })
            .collect();

        let outcome = if fits.values().any(Option::is_some) {
            EntityOutcome::Written
        } else {
            EntityOutcome::Withheld
        };
        self.store.update_derived(entity, |s| {
            for (category, fit) in &fits {
                if let Some(counters) = s.categories.get_mut(category) {
                    counters.trend = fit.map(|f| f.direction);
                    counters.trend_slope = fit.map(|f| f.slope);
                }
            }
        })?;
        Ok(outcome)
    }

    fn absence_entity(
        &self,
        entity: &EntityRef,
        as_of: DateTime<Utc>,
    ) -> Result<EntityOutcome, PipelineError> {
        let rules = self.store.rules().absence_rules();
        if rules.is_empty() {
            return Ok(EntityOutcome::Withheld);
        }
        let snap = self.snapshot(entity)?;
        let evaluations = evaluate_absence(rules, &snap.profile, &snap.activity, as_of);
        if evaluations.is_empty() {
            return Ok(EntityOutcome::Withheld);
        }
        self.store.update_derived(entity, |s| {
            s.apply_rule_outcomes(&evaluations, as_of);
        })?;
        Ok(EntityOutcome::Written)
    }

    // -----------------------------------------------------------------------
    // Cross-entity methods
    // -----------------------------------------------------------------------

    fn run_control_charts(&self, as_of: DateTime<Utc>) -> MethodReport {
        let mut by_property: BTreeMap<String, Vec<EntitySnapshot>> = BTreeMap::new();
        for entity in self.store.entities() {
            if entity.entity_type == EntityType::Property {
                continue;
            }
            let Some(snap) = self.store.snapshot(&entity) else {
                continue;
            };
            if let Some(property_id) = snap.profile.property_id.clone() {
                by_property.entry(property_id).or_default().push(snap);
            }
        }

        let mut report = MethodReport::new(AnalysisMethod::ControlCharts);
        for (property_id, snaps) in by_property {
            let result = self.chart_property(&property_id, &snaps, as_of);
            report.record(&property_id, result);
        }
        report
    }

    fn chart_property(
        &self,
        property_id: &str,
        snaps: &[EntitySnapshot],
        as_of: DateTime<Utc>,
    ) -> Result<EntityOutcome, PipelineError> {
        let members: Vec<Member<'_>> = snaps.iter().map(|s| (&s.profile, &s.activity)).collect();
        let mut charts = Vec::new();
        let mut chart_flags = Vec::new();
        let mut localized = Vec::new();
        for metric in MetricFamily::ALL {
            if let Some((chart, flag)) =
                spc::build_chart(property_id, metric, &members, as_of, &self.config)
            {
                charts.push(chart);
                chart_flags.extend(flag);
            }
            localized.extend(spc::localized_issues(
                property_id,
                metric,
                &members,
                as_of,
                &self.config,
            ));
        }

        if let Some(db) = self.store.db() {
            db.lock().replace_control_charts(property_id, &charts)?;
        }
        for flag in chart_flags.iter().chain(localized.iter()) {
            log::info!("property {}: {}", property_id, flag.description);
        }

        let property = EntityRef::property(property_id);
        if self.store.contains(&property) {
            let retention = self.store.anomaly_retention();
            self.store.update_derived(&property, |s| {
                s.replace_anomalies(AnomalySource::ControlChart, chart_flags, retention);
                s.replace_anomalies(AnomalySource::Localized, localized, retention);
            })?;
        }

        if charts.is_empty() {
            self.charts.remove(property_id);
            Ok(EntityOutcome::Withheld)
        } else {
            self.charts.insert(property_id.to_string(), charts);
            Ok(EntityOutcome::Written)
        }
    }

    /// Two passes: local seasonal curves pooled per segment, then each
    /// entity checked against its own curve or its segment's.
    fn run_seasonal(&self, as_of: DateTime<Utc>) -> MethodReport {
        struct SeriesSet {
            entity: EntityRef,
            segment: Option<String>,
            series: Vec<(MetricFamily, Vec<(MonthKey, f64)>)>,
        }

        let sets: Vec<SeriesSet> = self
            .store
            .entities()
            .into_iter()
            .filter_map(|entity| self.store.snapshot(&entity))
            .map(|snap| SeriesSet {
                entity: snap.profile.entity.clone(),
                segment: snap.profile.segment.clone(),
                series: MetricFamily::ALL
                    .iter()
                    .filter(|m| m.kind() == MetricKind::Rate)
                    .map(|m| {
                        (
                            *m,
                            baseline::monthly_rate_series(
                                &snap.activity,
                                *m,
                                as_of,
                                SEASONAL_HISTORY_MONTHS,
                            ),
                        )
                    })
                    .filter(|(_, s)| !s.is_empty())
                    .collect(),
            })
            .collect();

        let mut pooled: BTreeMap<(Option<String>, MetricFamily), Vec<SeasonalIndices>> =
            BTreeMap::new();
        for set in &sets {
            for (metric, series) in &set.series {
                if let Some(d) = seasonal::decompose(series, self.config.min_seasonal_months) {
                    pooled
                        .entry((set.segment.clone(), *metric))
                        .or_default()
                        .push(d.indices);
                }
            }
        }
        let curves: BTreeMap<(Option<String>, MetricFamily), SeasonalIndices> = pooled
            .into_iter()
            .filter_map(|(key, peers)| seasonal::cohort_curve(&peers).map(|c| (key, c)))
            .collect();

        let mut report = MethodReport::new(AnalysisMethod::Seasonal);
        for set in sets {
            let mut flags = Vec::new();
            let mut checked = false;
            for (metric, series) in &set.series {
                let curve = curves.get(&(set.segment.clone(), *metric));
                if let SeasonalOutcome::Checked { flag, .. } =
                    seasonal::seasonal_anomaly(*metric, series, curve, as_of, &self.config)
                {
                    checked = true;
                    flags.extend(flag);
                }
            }
            let retention = self.store.anomaly_retention();
            let result = self
                .store
                .update_derived(&set.entity, |s| {
                    s.replace_anomalies(AnomalySource::Seasonal, flags, retention)
                })
                .map(|_| {
                    if checked {
                        EntityOutcome::Written
                    } else {
                        EntityOutcome::Withheld
                    }
                });
            report.record(&set.entity.to_string(), result);
        }
        report
    }

    /// Percentile of each entity's baseline median within its segment.
    fn run_cohorts(&self) -> MethodReport {
        let mut segments: BTreeMap<String, Vec<EntityRef>> = BTreeMap::new();
        for profile in self.store.profiles() {
            if let Some(segment) = profile.segment {
                segments.entry(segment).or_default().push(profile.entity);
            }
        }

        let mut ranks: BTreeMap<EntityRef, BTreeMap<MetricFamily, f64>> = BTreeMap::new();
        for members in segments.values() {
            for metric in MetricFamily::ALL {
                let values: Vec<(EntityRef, f64)> = members
                    .iter()
                    .filter_map(|e| self.baselines.get(e, metric).map(|b| (e.clone(), b.median)))
                    .collect();
                for (entity, pct) in cohort::rank_segment(&values, self.config.min_cohort_size) {
                    ranks.entry(entity).or_default().insert(metric, pct);
                }
            }
        }

        let mut report = MethodReport::new(AnalysisMethod::Cohorts);
        for entity in segments.into_values().flatten() {
            let percentiles = ranks.remove(&entity).unwrap_or_default();
            let outcome = if percentiles.is_empty() {
                EntityOutcome::Withheld
            } else {
                EntityOutcome::Written
            };
            let result = self
                .store
                .update_derived(&entity, |s| s.cohort_percentiles = percentiles)
                .map(|_| outcome);
            report.record(&entity.to_string(), result);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::entity::EntityProfile;
    use crate::signals::bus::{MetricObservation, Polarity, SignalEvent, SignalWeight};
    use crate::signals::rules::{EscalationRule, RulePredicate, RuleTable, Severity};
    use crate::types::SentimentConfig;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn person(id: &str) -> EntityRef {
        EntityRef::new(EntityType::Person, id)
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    fn rules() -> Arc<RuleTable> {
        Arc::new(
            RuleTable::new(vec![EscalationRule {
                rule_id: "silent_90".to_string(),
                predicate: RulePredicate::Absence {
                    entity_type: EntityType::Person,
                    required_tag: None,
                    category: "communication".to_string(),
                    window_days: 90,
                },
                severity: Severity::Outreach,
                recommended_action: "wellness_check".to_string(),
            }])
            .expect("rules"),
        )
    }

    fn runner_with(db: Option<Arc<Mutex<SignalDb>>>) -> AnalysisRunner {
        let store = Arc::new(SummaryStore::new(rules(), SentimentConfig::default(), 20, db));
        AnalysisRunner::new(store, Arc::new(BaselineStore::new(&AnalysisConfig::default())), AnalysisConfig::default())
    }

    fn maintenance(id: &str, entity: &EntityRef, when: DateTime<Utc>) -> SignalEvent {
        SignalEvent {
            id: id.to_string(),
            event_type: "work_order_opened".to_string(),
            occurred_at: when,
            entity_refs: vec![entity.clone()],
            category: "maintenance".to_string(),
            weight: SignalWeight::Moderate,
            polarity: Polarity::Negative,
            payload: serde_json::Value::Null,
            observations: vec![MetricObservation {
                metric: MetricFamily::MaintenanceRate,
                value: 1.0,
            }],
        }
    }

    fn communication(id: &str, entity: &EntityRef, when: DateTime<Utc>) -> SignalEvent {
        SignalEvent {
            id: id.to_string(),
            event_type: "message_received".to_string(),
            occurred_at: when,
            entity_refs: vec![entity.clone()],
            category: "communication".to_string(),
            weight: SignalWeight::Weak,
            polarity: Polarity::Neutral,
            payload: serde_json::Value::Null,
            observations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_baseline_withheld_until_sixth_month() {
        let runner = runner_with(None);
        let p = person("p-1");
        runner.store.register(EntityProfile::new(p.clone())).expect("register");
        for month in 1..=5 {
            runner
                .store
                .apply_signal(&maintenance(&format!("m{}", month), &p, at(2025, month, 10)), None)
                .expect("apply");
        }

        let report = runner.run_cycle(&[AnalysisMethod::Baselines], at(2025, 6, 15)).await;
        assert_eq!(report.method(AnalysisMethod::Baselines).unwrap().withheld, 1);
        assert!(runner.baselines.get(&p, MetricFamily::MaintenanceRate).is_none());

        runner
            .store
            .apply_signal(&maintenance("m6", &p, at(2025, 6, 20)), None)
            .expect("apply");
        let report = runner.run_cycle(&[AnalysisMethod::Baselines], at(2025, 7, 5)).await;
        assert_eq!(report.method(AnalysisMethod::Baselines).unwrap().written, 1);
        let baseline = runner
            .baselines
            .get(&p, MetricFamily::MaintenanceRate)
            .expect("baseline after six months");
        assert_eq!(baseline.observations, 6);
        assert_eq!(baseline.median, 1.0);
    }

    #[tokio::test]
    async fn test_trend_written_for_declining_category() {
        let runner = runner_with(None);
        let p = person("p-1");
        runner.store.register(EntityProfile::new(p.clone())).expect("register");
        let mut n = 0;
        for month in 1..=6u32 {
            for _ in 0..month {
                n += 1;
                runner
                    .store
                    .apply_signal(&maintenance(&format!("m{}", n), &p, at(2025, month, 5)), None)
                    .expect("apply");
            }
        }
        runner.run_cycle(&[AnalysisMethod::Trends], at(2025, 6, 28)).await;
        let summary = runner.store.summary(&p).expect("summary");
        let counters = &summary.categories["maintenance"];
        assert_eq!(counters.trend, Some(trend::TrendDirection::Declining));
        assert!(counters.trend_slope.unwrap() < 0.0);
    }

    #[tokio::test]
    async fn test_absence_fires_then_clears() {
        let runner = runner_with(None);
        let p = person("p-1");
        runner.store.register(EntityProfile::new(p.clone())).expect("register");

        runner.run_cycle(&[AnalysisMethod::Absence], at(2026, 3, 1)).await;
        let summary = runner.store.summary(&p).expect("summary");
        assert_eq!(summary.escalations.len(), 1);
        assert_eq!(summary.escalations[0].rule_id, "silent_90");

        runner
            .store
            .apply_signal(&communication("c1", &p, at(2026, 3, 2)), None)
            .expect("apply");
        runner.run_cycle(&[AnalysisMethod::Absence], at(2026, 3, 3)).await;
        assert!(runner.store.summary(&p).unwrap().escalations.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_entity_skips_absence() {
        let runner = runner_with(None);
        let p = person("p-1");
        runner
            .store
            .register(EntityProfile::new(p.clone()).inactive())
            .expect("register");
        let report = runner.run_cycle(&[AnalysisMethod::Absence], at(2026, 3, 1)).await;
        assert_eq!(report.method(AnalysisMethod::Absence).unwrap().withheld, 1);
        assert!(runner.store.summary(&p).unwrap().escalations.is_empty());
    }

    #[tokio::test]
    async fn test_control_chart_flags_property() {
        let runner = runner_with(None);
        let property = EntityRef::property("prop-1");
        runner
            .store
            .register(EntityProfile::new(property.clone()))
            .expect("register property");
        let units: Vec<EntityRef> = (0..2)
            .map(|i| EntityRef::new(EntityType::Unit, format!("u-{}", i)))
            .collect();
        for u in &units {
            runner
                .store
                .register(EntityProfile::new(u.clone()).with_property("prop-1"))
                .expect("register unit");
        }

        let mut n = 0;
        let mut emit = |count: usize, when: DateTime<Utc>| {
            for _ in 0..count {
                n += 1;
                let unit = &units[n % 2];
                runner
                    .store
                    .apply_signal(&maintenance(&format!("m{}", n), unit, when), None)
                    .expect("apply");
            }
        };
        // Twelve quiet months alternating 2 and 3 work orders, then a spike.
        for i in 0..12i64 {
            let (year, month) = crate::store::activity::add_months((2025, 3), i);
            emit(if i % 2 == 0 { 2 } else { 3 }, at(year, month, 8));
        }
        emit(15, at(2026, 3, 8));

        let report = runner
            .run_cycle(&[AnalysisMethod::ControlCharts], at(2026, 4, 3))
            .await;
        assert_eq!(report.method(AnalysisMethod::ControlCharts).unwrap().written, 1);

        let chart = runner
            .charts_for("prop-1")
            .into_iter()
            .find(|c| c.metric == MetricFamily::MaintenanceRate)
            .expect("maintenance chart");
        assert!(chart.out_of_control());
        let flags = &runner.store.summary(&property).unwrap().anomalies;
        assert!(flags.iter().any(|f| f.source == AnomalySource::ControlChart));
    }

    #[tokio::test]
    async fn test_cohort_percentiles_need_min_segment() {
        let runner = runner_with(None);
        let as_of = at(2025, 8, 2);
        let mut n = 0;
        for (i, segment) in ["a", "a", "a", "a", "a", "b", "b"].iter().enumerate() {
            let p = person(&format!("p-{}", i));
            runner
                .store
                .register(EntityProfile::new(p.clone()).with_segment(*segment))
                .expect("register");
            for month in 1..=7u32 {
                for _ in 0..=i {
                    n += 1;
                    runner
                        .store
                        .apply_signal(&maintenance(&format!("m{}", n), &p, at(2025, month, 3)), None)
                        .expect("apply");
                }
            }
        }
        runner
            .run_cycle(&[AnalysisMethod::Baselines, AnalysisMethod::Cohorts], as_of)
            .await;

        let top = runner.store.summary(&person("p-4")).unwrap();
        let pct = top.cohort_percentiles[&MetricFamily::MaintenanceRate];
        assert!(pct > 80.0, "highest maintenance rate in segment, got {}", pct);
        let small = runner.store.summary(&person("p-5")).unwrap();
        assert!(small.cohort_percentiles.is_empty(), "segment of two is withheld");
    }

    #[tokio::test]
    async fn test_entity_failure_does_not_abort_cycle() {
        let db = Arc::new(Mutex::new(test_db()));
        let runner = runner_with(Some(db.clone()));
        for i in 0..3 {
            let p = person(&format!("p-{}", i));
            runner.store.register(EntityProfile::new(p.clone())).expect("register");
            runner
                .store
                .apply_signal(&maintenance(&format!("m{}", i), &p, at(2025, 1, 5)), None)
                .expect("apply");
        }
        db.lock()
            .conn_ref()
            .execute_batch("DROP TABLE entity_baselines")
            .expect("drop");

        let report = runner
            .run_cycle(&[AnalysisMethod::Baselines, AnalysisMethod::Trends], at(2025, 2, 1))
            .await;
        assert_eq!(report.method(AnalysisMethod::Baselines).unwrap().failed, 3);
        let trends = report.method(AnalysisMethod::Trends).unwrap();
        assert_eq!(trends.processed, 3);
        assert_eq!(trends.failed, 0);
    }
}
