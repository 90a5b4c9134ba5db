//! Cron cadences for the batch methods.
//!
//! The runner is triggered externally; this only answers which methods are
//! due given when each last ran. Expressions use the 5-field cron format.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use super::AnalysisMethod;
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub enabled: bool,
    pub cron: String,
}

impl ScheduleEntry {
    fn new(cron: &str) -> Self {
        Self {
            enabled: true,
            cron: cron.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchSchedule(pub BTreeMap<AnalysisMethod, ScheduleEntry>);

impl Default for BatchSchedule {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        // Nightly
        entries.insert(AnalysisMethod::Baselines, ScheduleEntry::new("0 2 * * *"));
        entries.insert(AnalysisMethod::ControlCharts, ScheduleEntry::new("30 2 * * *"));
        entries.insert(AnalysisMethod::Absence, ScheduleEntry::new("0 6 * * *"));
        // Weekly, Mondays
        entries.insert(AnalysisMethod::Trends, ScheduleEntry::new("0 3 * * 1"));
        entries.insert(AnalysisMethod::Cohorts, ScheduleEntry::new("0 5 * * 1"));
        // Monthly
        entries.insert(AnalysisMethod::Seasonal, ScheduleEntry::new("0 4 1 * *"));
        Self(entries)
    }
}

impl BatchSchedule {
    /// Reject unparseable expressions up front.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for entry in self.0.values() {
            parse_cron(&entry.cron)?;
        }
        Ok(())
    }

    /// Next scheduled time strictly after `after`, or `None` when disabled.
    pub fn next_due(
        &self,
        method: AnalysisMethod,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PipelineError> {
        let Some(entry) = self.0.get(&method).filter(|e| e.enabled) else {
            return Ok(None);
        };
        let schedule = parse_cron(&entry.cron)?;
        Ok(schedule.after(&after).next())
    }

    /// Methods with a scheduled time in `(last_run, now]`. A method that
    /// has never run is due immediately.
    pub fn due_methods(
        &self,
        last_runs: &BTreeMap<AnalysisMethod, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisMethod>, PipelineError> {
        let mut due = Vec::new();
        for method in AnalysisMethod::ALL {
            let Some(entry) = self.0.get(&method).filter(|e| e.enabled) else {
                continue;
            };
            let is_due = match last_runs.get(&method) {
                None => true,
                Some(last) => {
                    let schedule = parse_cron(&entry.cron)?;
                    schedule.after(last).next().is_some_and(|next| next <= now)
                }
            };
            if is_due {
                due.push(method);
            }
        }
        Ok(due)
    }
}

/// Parse a 5-field cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, PipelineError> {
    // The cron crate expects a leading seconds field
    let full_expr = format!("0 {}", expr);

    full_expr.parse::<Schedule>().map_err(|e| {
        PipelineError::Config(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_cron_nightly() {
        assert!(parse_cron("0 2 * * *").is_ok());
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_default_schedule_valid() {
        assert!(BatchSchedule::default().validate().is_ok());
    }

    #[test]
    fn test_never_run_is_due() {
        let due = BatchSchedule::default()
            .due_methods(&BTreeMap::new(), at(1, 0, 0))
            .expect("due");
        assert_eq!(due.len(), AnalysisMethod::ALL.len());
    }

    #[test]
    fn test_due_after_scheduled_time_passes() {
        let schedule = BatchSchedule::default();
        let mut last = BTreeMap::new();
        last.insert(AnalysisMethod::Baselines, at(10, 2, 5));

        let before = schedule.due_methods(&last, at(11, 1, 0)).expect("due");
        assert!(!before.contains(&AnalysisMethod::Baselines));

        let after = schedule.due_methods(&last, at(11, 2, 1)).expect("due");
        assert!(after.contains(&AnalysisMethod::Baselines));
    }

    #[test]
    fn test_disabled_method_never_due() {
        let mut schedule = BatchSchedule::default();
        if let Some(entry) = schedule.0.get_mut(&AnalysisMethod::Seasonal) {
            entry.enabled = false;
        }
        let due = schedule.due_methods(&BTreeMap::new(), at(1, 0, 0)).expect("due");
        assert!(!due.contains(&AnalysisMethod::Seasonal));
        assert_eq!(schedule.next_due(AnalysisMethod::Seasonal, at(1, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_next_due_monthly() {
        let next = BatchSchedule::default()
            .next_due(AnalysisMethod::Seasonal, at(2, 0, 0))
            .expect("next")
            .expect("enabled");
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 4, 1, 4, 0, 0).unwrap());
    }
}
