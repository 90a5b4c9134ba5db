//! Statistical analysis engine.
//!
//! Everything below `runner` and `schedule` is a pure function of an
//! activity window. The runner applies them across the store on demand.

pub mod absence;
pub mod baseline;
pub mod cohort;
pub mod runner;
pub mod schedule;
pub mod seasonal;
pub mod spc;
pub mod stats;
pub mod trend;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Batch methods that run on independent schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Baselines,
    Trends,
    ControlCharts,
    Seasonal,
    Cohorts,
    Absence,
}

impl AnalysisMethod {
    /// Baselines first so cohorts and event-time checks see fresh medians.
    pub const ALL: [AnalysisMethod; 6] = [
        AnalysisMethod::Baselines,
        AnalysisMethod::Trends,
        AnalysisMethod::ControlCharts,
        AnalysisMethod::Seasonal,
        AnalysisMethod::Cohorts,
        AnalysisMethod::Absence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMethod::Baselines => "baselines",
            AnalysisMethod::Trends => "trends",
            AnalysisMethod::ControlCharts => "control_charts",
            AnalysisMethod::Seasonal => "seasonal",
            AnalysisMethod::Cohorts => "cohorts",
            AnalysisMethod::Absence => "absence",
        }
    }

    pub fn from_str_lossy(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for AnalysisMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
