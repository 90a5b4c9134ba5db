//! Materialized per-entity signal summary.
//!
//! Applying a signal touches one category's counters, a bounded window of
//! recent marks, the rules scoped to that category and the sentiment score.
//! None of it depends on how much history the entity has.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::trend::TrendDirection;
use crate::entity::EntityRef;
use crate::signals::bus::{MetricFamily, Polarity, SignalEvent, SignalWeight};
use crate::signals::rules::{ActiveEscalation, CountCondition, RuleEvaluation, RuleTable, WindowCounts};
use crate::signals::sentiment::{self, SentimentLabel};
use crate::types::SentimentConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Timestamp, weight and polarity of a recent signal, kept only as long as
/// some rule window can still see it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMark {
    pub occurred_at: DateTime<Utc>,
    pub weight: SignalWeight,
    pub polarity: Polarity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CategoryCounters {
    pub total: u64,
    /// counts[weight][polarity]
    pub counts: [[u64; 3]; 4],
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_signal_at: Option<DateTime<Utc>>,
    /// Sorted by `occurred_at`.
    pub recent: Vec<SignalMark>,
}

impl CategoryCounters {
    pub fn record(&mut self, weight: SignalWeight, polarity: Polarity) {
        self.total += 1;
        self.counts[weight.index()][polarity.index()] += 1;
    }

    pub fn count(&self, weight: SignalWeight, polarity: Polarity) -> u64 {
        self.counts[weight.index()][polarity.index()]
    }

    pub fn by_weight(&self, weight: SignalWeight) -> u64 {
        self.counts[weight.index()].iter().sum()
    }

    pub fn by_polarity(&self, polarity: Polarity) -> u64 {
        self.counts.iter().map(|row| row[polarity.index()]).sum()
    }

    /// Insert a mark in time order, then drop marks no rule window can reach.
    fn insert_mark(&mut self, mark: SignalMark, horizon_days: i64, as_of: DateTime<Utc>) {
        if horizon_days <= 0 {
            self.recent.clear();
            return;
        }
        let pos = self
            .recent
            .partition_point(|m| m.occurred_at <= mark.occurred_at);
        self.recent.insert(pos, mark);
        let cutoff = as_of - Duration::days(horizon_days);
        let stale = self.recent.partition_point(|m| m.occurred_at < cutoff);
        if stale > 0 {
            self.recent.drain(..stale);
        }
    }

    fn count_marks(&self, condition: &CountCondition, as_of: DateTime<Utc>) -> u64 {
        let start = condition.window_start(as_of);
        let from = self.recent.partition_point(|m| m.occurred_at < start);
        self.recent[from..]
            .iter()
            .take_while(|m| m.occurred_at <= as_of)
            .filter(|m| condition.admits(m.weight, m.polarity))
            .count() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySource {
    /// Level metric z-score checked as the event arrived.
    EventTime,
    /// Level z-score or rate ratio from the batch baseline pass.
    Baseline,
    Seasonal,
    /// Property-level control chart breach.
    ControlChart,
    /// Sub-unit rate far above its property.
    Localized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyFlag {
    pub metric: String,
    pub source: AnomalySource,
    /// z-score, or ratio for rate checks.
    pub score: f64,
    pub observed: f64,
    pub expected: f64,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl AnomalyFlag {
    /// JSON has no encoding for NaN or infinity, so only finite flags persist.
    pub fn is_finite(&self) -> bool {
        self.score.is_finite() && self.observed.is_finite() && self.expected.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureWeight {
    pub feature: String,
    pub weight: f64,
}

/// Output of a trained model, stored verbatim with its explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOutput {
    pub model_id: String,
    pub value: f64,
    pub feature_importance: Vec<FeatureWeight>,
    pub scored_at: DateTime<Utc>,
}

/// What one apply changed in the escalation set.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub activated: Vec<ActiveEscalation>,
    pub cleared: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedSignalSummary {
    pub entity: EntityRef,
    pub categories: BTreeMap<String, CategoryCounters>,
    pub escalations: Vec<ActiveEscalation>,
    pub sentiment: SentimentLabel,
    pub sentiment_score: f64,
    #[serde(default)]
    pub anomalies: Vec<AnomalyFlag>,
    #[serde(default)]
    pub cohort_percentiles: BTreeMap<MetricFamily, f64>,
    #[serde(default)]
    pub model_outputs: BTreeMap<String, ModelOutput>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    pub signal_count: u64,
    /// Bumped on every committed change.
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

impl MaterializedSignalSummary {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            categories: BTreeMap::new(),
            escalations: Vec::new(),
            sentiment: SentimentLabel::Mixed,
            sentiment_score: 0.0,
            anomalies: Vec::new(),
            cohort_percentiles: BTreeMap::new(),
            model_outputs: BTreeMap::new(),
            recommended_actions: Vec::new(),
            signal_count: 0,
            version: 0,
            updated_at: None,
        }
    }

    /// Latest signal time across every category.
    pub fn last_signal_at(&self) -> Option<DateTime<Utc>> {
        self.categories.values().filter_map(|c| c.last_signal_at).max()
    }

    /// Fold one classified signal into the summary.
    ///
    /// Rules are evaluated at the later of the signal's own time and the
    /// newest signal already seen, so a late-arriving event cannot rewind
    /// the window.
    pub fn apply_signal(
        &mut self,
        signal: &SignalEvent,
        rules: &RuleTable,
        sentiment_config: &SentimentConfig,
    ) -> ApplyOutcome {
        let as_of = self
            .last_signal_at()
            .map_or(signal.occurred_at, |t| t.max(signal.occurred_at));
        let horizon = rules.horizon_days(&signal.category);

        let counters = self.categories.entry(signal.category.clone()).or_default();
        counters.record(signal.weight, signal.polarity);
        counters.last_signal_at = Some(
            counters
                .last_signal_at
                .map_or(signal.occurred_at, |t| t.max(signal.occurred_at)),
        );
        counters.insert_mark(
            SignalMark {
                occurred_at: signal.occurred_at,
                weight: signal.weight,
                polarity: signal.polarity,
            },
            horizon,
            as_of,
        );
        counters.score = sentiment::category_score(counters, sentiment_config);

        let evaluations = rules.evaluate(&signal.category, &*self, as_of);
        let outcome = self.apply_rule_outcomes(&evaluations, as_of);

        self.rescore(sentiment_config);
        self.signal_count += 1;
        self.updated_at = Some(as_of);
        self.version += 1;
        outcome
    }

    /// Activate newly firing rules and clear ones whose predicate no longer holds.
    pub fn apply_rule_outcomes(
        &mut self,
        evaluations: &[RuleEvaluation],
        as_of: DateTime<Utc>,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for eval in evaluations {
            let active = self
                .escalations
                .iter()
                .position(|e| e.rule_id == eval.rule.rule_id);
            match (eval.fired, active) {
                (true, None) => {
                    let escalation = ActiveEscalation {
                        rule_id: eval.rule.rule_id.clone(),
                        severity: eval.rule.severity,
                        cross_category: eval.rule.is_cross_category(),
                        recommended_action: eval.rule.recommended_action.clone(),
                        triggered_at: as_of,
                        detail: eval.detail.clone(),
                    };
                    log::info!(
                        "escalation {} ({}) activated for {}: {}",
                        escalation.rule_id,
                        escalation.severity,
                        self.entity,
                        escalation.detail
                    );
                    self.escalations.push(escalation.clone());
                    outcome.activated.push(escalation);
                }
                (false, Some(idx)) => {
                    let cleared = self.escalations.remove(idx);
                    log::info!(
                        "escalation {} cleared for {}: {}",
                        cleared.rule_id,
                        self.entity,
                        eval.detail
                    );
                    outcome.cleared.push(cleared.rule_id);
                }
                _ => {}
            }
        }
        if !outcome.activated.is_empty() || !outcome.cleared.is_empty() {
            self.refresh_recommendations();
        }
        outcome
    }

    /// Explicit clearance, e.g. after a manager resolves the situation.
    pub fn clear_escalation(&mut self, rule_id: &str) -> bool {
        let before = self.escalations.len();
        self.escalations.retain(|e| e.rule_id != rule_id);
        let removed = self.escalations.len() != before;
        if removed {
            self.refresh_recommendations();
            self.version += 1;
        }
        removed
    }

    /// Recompute sentiment from current counters.
    pub fn rescore(&mut self, config: &SentimentConfig) {
        let (score, label) = sentiment::assess(&self.categories, config);
        self.sentiment_score = score;
        self.sentiment = label;
    }

    /// Highest-severity escalation, if any.
    pub fn top_escalation(&self) -> Option<&ActiveEscalation> {
        self.escalations.iter().max_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then(a.cross_category.cmp(&b.cross_category))
        })
    }

    /// Append a flag, keeping at most `retention` (oldest dropped first).
    /// Flags with a non-finite number are dropped.
    pub fn push_anomaly(&mut self, flag: AnomalyFlag, retention: usize) {
        if !flag.is_finite() {
            log::warn!("{}: dropping non-finite anomaly {}", self.entity, flag.description);
            return;
        }
        self.anomalies.push(flag);
        self.trim_anomalies(retention);
    }

    /// Replace every flag from `source` with a fresh batch result.
    pub fn replace_anomalies(
        &mut self,
        source: AnomalySource,
        flags: Vec<AnomalyFlag>,
        retention: usize,
    ) {
        self.anomalies.retain(|f| f.source != source);
        let entity = &self.entity;
        self.anomalies.extend(flags.into_iter().filter(|f| {
            let keep = f.is_finite();
            if !keep {
                log::warn!("{}: dropping non-finite anomaly {}", entity, f.description);
            }
            keep
        }));
        self.anomalies.sort_by_key(|f| f.detected_at);
        self.trim_anomalies(retention);
    }

    fn trim_anomalies(&mut self, retention: usize) {
        if self.anomalies.len() > retention {
            let excess = self.anomalies.len() - retention;
            self.anomalies.drain(..excess);
        }
    }

    fn refresh_recommendations(&mut self) {
        let mut ordered: Vec<&ActiveEscalation> = self.escalations.iter().collect();
        ordered.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.rule_id.cmp(&b.rule_id)));
        let mut actions: Vec<String> = Vec::with_capacity(ordered.len());
        for e in ordered {
            if !actions.contains(&e.recommended_action) {
                actions.push(e.recommended_action.clone());
            }
        }
        self.recommended_actions = actions;
    }
}

impl WindowCounts for MaterializedSignalSummary {
    fn count_in_window(&self, condition: &CountCondition, as_of: DateTime<Utc>) -> u64 {
        self.categories
            .get(&condition.category)
            .map_or(0, |c| c.count_marks(condition, as_of))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
