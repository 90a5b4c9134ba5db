//! Escalation rules and their evaluation.
//!
//! Rules are load-time configuration held in an immutable table keyed by
//! category, so an event only re-evaluates the rules scoped to the category
//! it touched. Evaluation order within a category is fixed: count-based
//! rules first, then cross-category conjunctions. Absence rules cannot fire
//! on the event path and are evaluated by the batch scan instead.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bus::{Polarity, SignalWeight};
use crate::entity::{EntityProfile, EntityType};
use crate::error::PipelineError;
use crate::store::activity::days_before;

/// Longest window any rule or retention setting may span (ten years).
pub const MAX_WINDOW_DAYS: i64 = 3650;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Informational,
    Outreach,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Informational => "informational",
            Severity::Outreach => "outreach",
            Severity::Critical => "critical",
        })
    }
}

/// "At least `count` signals in `category` within the trailing `window_days`",
/// optionally restricted by polarity and minimum weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountCondition {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity: Option<Polarity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_weight: Option<SignalWeight>,
    pub count: u32,
    pub window_days: i64,
}

impl CountCondition {
    /// Whether a signal with these attributes counts toward the condition.
    pub fn admits(&self, weight: SignalWeight, polarity: Polarity) -> bool {
        self.polarity.map_or(true, |p| p == polarity)
            && self.min_weight.map_or(true, |w| weight >= w)
    }

    /// Inclusive start of the sliding window ending at `as_of`.
    pub fn window_start(&self, as_of: DateTime<Utc>) -> DateTime<Utc> {
        days_before(as_of, self.window_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagMatch {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePredicate {
    CountThreshold {
        condition: CountCondition,
    },
    /// Every condition must hold at once.
    CrossCategory {
        conditions: Vec<CountCondition>,
    },
    /// Entities matching a structural predicate with zero qualifying
    /// activity in the window. Batch-only.
    #[serde(rename_all = "camelCase")]
    Absence {
        entity_type: EntityType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        required_tag: Option<TagMatch>,
        category: String,
        window_days: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRule {
    pub rule_id: String,
    pub predicate: RulePredicate,
    pub severity: Severity,
    pub recommended_action: String,
}

impl RulePredicate {
    /// Windowed count conditions this predicate is built from.
    pub fn count_conditions(&self) -> &[CountCondition] {
        match self {
            RulePredicate::CountThreshold { condition } => std::slice::from_ref(condition),
            RulePredicate::CrossCategory { conditions } => conditions,
            RulePredicate::Absence { .. } => &[],
        }
    }
}

impl EscalationRule {
    pub fn is_cross_category(&self) -> bool {
        matches!(self.predicate, RulePredicate::CrossCategory { .. })
    }

    /// Structural match for absence rules; false for every other predicate.
    pub fn absence_applies_to(&self, profile: &EntityProfile) -> bool {
        match &self.predicate {
            RulePredicate::Absence {
                entity_type,
                required_tag,
                ..
            } => {
                profile.active
                    && profile.entity.entity_type == *entity_type
                    && required_tag
                        .as_ref()
                        .map_or(true, |t| profile.tags.get(&t.key) == Some(&t.value))
            }
            _ => false,
        }
    }
}

/// An escalation recorded against an entity. Persists until a later
/// evaluation clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEscalation {
    pub rule_id: String,
    pub severity: Severity,
    pub cross_category: bool,
    pub recommended_action: String,
    pub triggered_at: DateTime<Utc>,
    pub detail: String,
}

/// Source of windowed counts. Implemented by the cached summary marks and
/// by a direct recount over raw activity, which must agree.
pub trait WindowCounts {
    fn count_in_window(&self, condition: &CountCondition, as_of: DateTime<Utc>) -> u64;
}

/// Result of evaluating one rule.
#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    pub rule: Arc<EscalationRule>,
    pub fired: bool,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

/// Immutable rule table, rebuilt only on restart.
#[derive(Debug, Default)]
pub struct RuleTable {
    by_category: HashMap<String, Vec<Arc<EscalationRule>>>,
    absence: Vec<Arc<EscalationRule>>,
    horizons: HashMap<String, i64>,
}

impl RuleTable {
    pub fn new(rules: Vec<EscalationRule>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            validate_rule(rule)?;
            if !seen.insert(rule.rule_id.clone()) {
                return Err(PipelineError::Config(format!(
                    "duplicate escalation rule id {}",
                    rule.rule_id
                )));
            }
        }

        let mut count_rules: HashMap<String, Vec<Arc<EscalationRule>>> = HashMap::new();
        let mut cross_rules: HashMap<String, Vec<Arc<EscalationRule>>> = HashMap::new();
        let mut absence = Vec::new();
        let mut horizons: HashMap<String, i64> = HashMap::new();

        for rule in rules {
            let rule = Arc::new(rule);
            match &rule.predicate {
                RulePredicate::CountThreshold { condition } => {
                    bump_horizon(&mut horizons, condition);
                    count_rules
                        .entry(condition.category.clone())
                        .or_default()
                        .push(rule.clone());
                }
                RulePredicate::CrossCategory { conditions } => {
                    let mut scoped = HashSet::new();
                    for condition in conditions {
                        bump_horizon(&mut horizons, condition);
                        if scoped.insert(condition.category.clone()) {
                            cross_rules
                                .entry(condition.category.clone())
                                .or_default()
                                .push(rule.clone());
                        }
                    }
                }
                RulePredicate::Absence { .. } => absence.push(rule),
            }
        }

        let mut by_category = count_rules;
        for (category, rules) in cross_rules {
            by_category.entry(category).or_default().extend(rules);
        }

        Ok(Self {
            by_category,
            absence,
            horizons,
        })
    }

    /// Rules scoped to a category in evaluation order (count, then cross-category).
    pub fn rules_for(&self, category: &str) -> &[Arc<EscalationRule>] {
        self.by_category
            .get(category)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn absence_rules(&self) -> &[Arc<EscalationRule>] {
        &self.absence
    }

    /// Longest window any rule looks back over for this category, in days.
    /// Cached window marks older than this can be discarded.
    pub fn horizon_days(&self, category: &str) -> i64 {
        self.horizons.get(category).copied().unwrap_or(0)
    }

    /// Longest window across every rule, absence rules included.
    pub fn max_window_days(&self) -> i64 {
        let absence = self.absence.iter().map(|r| match &r.predicate {
            RulePredicate::Absence { window_days, .. } => *window_days,
            _ => 0,
        });
        self.horizons.values().copied().chain(absence).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        let mut ids = HashSet::new();
        for rule in self.by_category.values().flatten().chain(self.absence.iter()) {
            ids.insert(rule.rule_id.as_str());
        }
        ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every rule scoped to `category`. Cost is O(R) in the number
    /// of scoped rules, independent of history length.
    pub fn evaluate(
        &self,
        category: &str,
        counts: &dyn WindowCounts,
        as_of: DateTime<Utc>,
    ) -> Vec<RuleEvaluation> {
        self.rules_for(category)
            .iter()
            .map(|rule| evaluate_rule(rule, counts, as_of))
            .collect()
    }
}

fn bump_horizon(horizons: &mut HashMap<String, i64>, condition: &CountCondition) {
    let entry = horizons.entry(condition.category.clone()).or_insert(0);
    *entry = (*entry).max(condition.window_days);
}

fn validate_rule(rule: &EscalationRule) -> Result<(), PipelineError> {
    if rule.rule_id.trim().is_empty() {
        return Err(PipelineError::Config("escalation rule id is required".into()));
    }
    let check = |c: &CountCondition| -> Result<(), PipelineError> {
        if c.count == 0 {
            return Err(PipelineError::Config(format!(
                "rule {}: count must be positive",
                rule.rule_id
            )));
        }
        check_window(rule, c.window_days)?;
        Ok(())
    };
    match &rule.predicate {
        RulePredicate::CountThreshold { condition } => check(condition),
        RulePredicate::CrossCategory { conditions } => {
            let categories: HashSet<&str> =
                conditions.iter().map(|c| c.category.as_str()).collect();
            if categories.len() < 2 {
                return Err(PipelineError::Config(format!(
                    "rule {}: cross-category rules need at least two categories",
                    rule.rule_id
                )));
            }
            conditions.iter().try_for_each(check)
        }
        RulePredicate::Absence { window_days, .. } => check_window(rule, *window_days),
    }
}

fn check_window(rule: &EscalationRule, window_days: i64) -> Result<(), PipelineError> {
    if window_days <= 0 || window_days > MAX_WINDOW_DAYS {
        return Err(PipelineError::Config(format!(
            "rule {}: windowDays must be between 1 and {}",
            rule.rule_id, MAX_WINDOW_DAYS
        )));
    }
    Ok(())
}

fn evaluate_rule(
    rule: &Arc<EscalationRule>,
    counts: &dyn WindowCounts,
    as_of: DateTime<Utc>,
) -> RuleEvaluation {
    let (fired, detail) = match &rule.predicate {
        RulePredicate::CountThreshold { condition } => {
            let n = counts.count_in_window(condition, as_of);
            (
                n >= condition.count as u64,
                format!(
                    "{} {} signal(s) in {} days (threshold {})",
                    n, condition.category, condition.window_days, condition.count
                ),
            )
        }
        RulePredicate::CrossCategory { conditions } => {
            let mut parts = Vec::with_capacity(conditions.len());
            let mut all = true;
            for condition in conditions {
                let n = counts.count_in_window(condition, as_of);
                all &= n >= condition.count as u64;
                parts.push(format!("{}={}/{}", condition.category, n, condition.count));
            }
            (all, format!("cross-category: {}", parts.join(", ")))
        }
        RulePredicate::Absence { .. } => (false, String::new()),
    };
    RuleEvaluation {
        rule: rule.clone(),
        fired,
        detail,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
