//! Scheduled scan for absence rules.
//!
//! The event path only sees signals that arrive, so "no communication from
//! an active resident in 90 days" can only be detected by looking. Each
//! absence rule is checked against every structurally matching entity;
//! an entity that has activity again gets the escalation cleared.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::entity::EntityProfile;
use crate::signals::rules::{EscalationRule, RuleEvaluation, RulePredicate};
use crate::store::activity::ActivityLog;

/// Evaluate every absence rule that applies to this entity.
pub fn evaluate_absence(
    rules: &[Arc<EscalationRule>],
    profile: &EntityProfile,
    activity: &ActivityLog,
    as_of: DateTime<Utc>,
) -> Vec<RuleEvaluation> {
    rules
        .iter()
        .filter(|rule| rule.absence_applies_to(profile))
        .filter_map(|rule| {
            let RulePredicate::Absence {
                category,
                window_days,
                ..
            } = &rule.predicate
            else {
                return None;
            };
            let since = as_of - Duration::days(*window_days);
            let qualifying = activity
                .range(since, as_of)
                .iter()
                .filter(|r| r.category == *category)
                .count();
            let detail = match activity.last_in_category(category) {
                Some(last) => format!(
                    "{} {} signal(s) in {} days, last {}",
                    qualifying,
                    category,
                    window_days,
                    last.occurred_at.format("%Y-%m-%d")
                ),
                None => format!("no {} activity on record", category),
            };
            Some(RuleEvaluation {
                rule: rule.clone(),
                fired: qualifying == 0,
                detail,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityRef, EntityType};
    use crate::signals::bus::{Polarity, SignalWeight};
    use crate::signals::rules::{RuleTable, Severity, TagMatch};
    use crate::store::activity::ActivityRecord;
    use chrono::TimeZone;

    fn table() -> RuleTable {
        RuleTable::new(vec![EscalationRule {
            rule_id: "silent_resident_90d".to_string(),
            predicate: RulePredicate::Absence {
                entity_type: EntityType::Person,
                required_tag: Some(TagMatch {
                    key: "lease".to_string(),
                    value: "active".to_string(),
                }),
                category: "communication".to_string(),
                window_days: 90,
            },
            severity: Severity::Informational,
            recommended_action: "check_in".to_string(),
        }])
        .expect("rules")
    }

    fn resident() -> EntityProfile {
        EntityProfile::new(EntityRef::new(EntityType::Person, "p-1")).with_tag("lease", "active")
    }

    fn message(at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            seq: 1,
            signal_id: "m-1".to_string(),
            event_type: "message_received".to_string(),
            category: "communication".to_string(),
            weight: SignalWeight::Weak,
            polarity: Polarity::Neutral,
            occurred_at: at,
            payload: serde_json::Value::Null,
            observations: Vec::new(),
        }
    }

    #[test]
    fn test_silence_fires_and_activity_clears() {
        let table = table();
        let as_of = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let stale = ActivityLog::from_records(vec![message(as_of - Duration::days(120))]);
        let evals = evaluate_absence(table.absence_rules(), &resident(), &stale, as_of);
        assert_eq!(evals.len(), 1);
        assert!(evals[0].fired);

        let recent = ActivityLog::from_records(vec![message(as_of - Duration::days(10))]);
        let evals = evaluate_absence(table.absence_rules(), &resident(), &recent, as_of);
        assert!(!evals[0].fired);
    }

    #[test]
    fn test_non_matching_entity_skipped() {
        let table = table();
        let vendor = EntityProfile::new(EntityRef::new(EntityType::Vendor, "v-1"));
        let evals = evaluate_absence(
            table.absence_rules(),
            &vendor,
            &ActivityLog::default(),
            Utc::now(),
        );
        assert!(evals.is_empty());
    }
}
