//! Configuration and shared tunables.
//!
//! Loaded from `~/.propintel/config.json`. Every field has a default so a
//! partial (or absent) file is valid. Formulas and evaluation order are
//! fixed in code; only weights and thresholds are tunable here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analysis::schedule::BatchSchedule;
use crate::analysis::stats::SpreadFloor;
use crate::error::PipelineError;
use crate::signals::bus::{Polarity, SignalWeight};
use crate::signals::rules::MAX_WINDOW_DAYS;

// ---------------------------------------------------------------------------
// Capability tiers
// ---------------------------------------------------------------------------

/// A processing capability level chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Nothing to do.
    NoOp,
    /// Rule engine / materialized data only. No external call.
    RuleEngine,
    Statistical,
    /// Trained model scoring or classifier output.
    Model,
    LanguageLight,
    LanguageStandard,
    LanguagePremium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::NoOp => "no_op",
            Tier::RuleEngine => "rule_engine",
            Tier::Statistical => "statistical",
            Tier::Model => "model",
            Tier::LanguageLight => "language_light",
            Tier::LanguageStandard => "language_standard",
            Tier::LanguagePremium => "language_premium",
        }
    }

    pub fn from_str_lossy(s: &str) -> Option<Self> {
        [
            Tier::NoOp,
            Tier::RuleEngine,
            Tier::Statistical,
            Tier::Model,
            Tier::LanguageLight,
            Tier::LanguageStandard,
            Tier::LanguagePremium,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }

    pub fn is_language(&self) -> bool {
        matches!(
            self,
            Tier::LanguageLight | Tier::LanguageStandard | Tier::LanguagePremium
        )
    }

    /// Tiers that invoke an external capability and count against cost limits.
    pub fn is_metered(&self) -> bool {
        self.is_language() || *self == Tier::Model
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input/output size ceilings a language tier declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCeiling {
    pub max_input_tokens: usize,
    pub max_output_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TierCeilings {
    pub light: TierCeiling,
    pub standard: TierCeiling,
    pub premium: TierCeiling,
}

impl Default for TierCeilings {
    fn default() -> Self {
        Self {
            light: TierCeiling {
                max_input_tokens: 2_000,
                max_output_tokens: 500,
            },
            standard: TierCeiling {
                max_input_tokens: 30_000,
                max_output_tokens: 3_000,
            },
            premium: TierCeiling {
                max_input_tokens: 60_000,
                max_output_tokens: 5_000,
            },
        }
    }
}

impl TierCeilings {
    pub fn for_tier(&self, tier: Tier) -> Option<TierCeiling> {
        match tier {
            Tier::LanguageLight => Some(self.light),
            Tier::LanguageStandard => Some(self.standard),
            Tier::LanguagePremium => Some(self.premium),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sentiment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightValues {
    pub weak: f64,
    pub moderate: f64,
    pub strong: f64,
    pub critical: f64,
}

impl Default for WeightValues {
    fn default() -> Self {
        Self {
            weak: 0.5,
            moderate: 2.0,
            strong: 5.0,
            critical: 10.0,
        }
    }
}

impl WeightValues {
    pub fn value(&self, weight: SignalWeight) -> f64 {
        match weight {
            SignalWeight::Weak => self.weak,
            SignalWeight::Moderate => self.moderate,
            SignalWeight::Strong => self.strong,
            SignalWeight::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolarityMultipliers {
    pub negative: f64,
    pub neutral: f64,
    pub positive: f64,
}

impl Default for PolarityMultipliers {
    fn default() -> Self {
        Self {
            negative: -1.0,
            neutral: 0.0,
            positive: 0.5,
        }
    }
}

impl PolarityMultipliers {
    pub fn multiplier(&self, polarity: Polarity) -> f64 {
        match polarity {
            Polarity::Negative => self.negative,
            Polarity::Neutral => self.neutral,
            Polarity::Positive => self.positive,
        }
    }
}

/// Lower bounds for each sentiment band (strictly greater than).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentimentBands {
    pub positive_above: f64,
    pub mixed_above: f64,
    pub concerning_above: f64,
}

impl Default for SentimentBands {
    fn default() -> Self {
        Self {
            positive_above: 0.3,
            mixed_above: -0.3,
            concerning_above: -1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentimentConfig {
    pub weight_values: WeightValues,
    pub polarity_multipliers: PolarityMultipliers,
    /// Per-category weight in the overall score. Missing categories weigh 1.0.
    pub category_weights: BTreeMap<String, f64>,
    pub bands: SentimentBands,
}

impl SentimentConfig {
    pub fn category_weight(&self, category: &str) -> f64 {
        self.category_weights.get(category).copied().unwrap_or(1.0)
    }
}

// ---------------------------------------------------------------------------
// Statistical analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisConfig {
    pub baseline_window_months: u32,
    pub min_baseline_observations: usize,
    pub anomaly_z_threshold: f64,
    /// Deviation checks never divide by a spread smaller than this, in the
    /// metric's own units.
    pub min_spread: f64,
    /// Nor by less than this fraction of the baseline center.
    pub min_relative_spread: f64,
    /// Rate metrics flag when current/baseline falls below this ratio.
    pub rate_ratio_threshold: f64,
    /// Monthly score slope beyond which a trend is improving/declining.
    pub trend_slope_threshold: f64,
    pub min_trend_months: usize,
    pub spc_sigma: f64,
    pub min_spc_months: usize,
    pub min_seasonal_months: usize,
    pub min_cohort_size: usize,
    /// Sub-unit rate / property rate at or above this flags a localized issue.
    pub localized_ratio_threshold: f64,
    pub min_localized_events: u64,
    /// Maximum anomaly flags retained per summary (oldest dropped first).
    pub anomaly_retention: usize,
    /// Entities per blocking task in a batch cycle.
    pub batch_chunk_size: usize,
}

impl AnalysisConfig {
    pub fn spread_floor(&self) -> SpreadFloor {
        SpreadFloor {
            absolute: self.min_spread,
            relative: self.min_relative_spread,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            baseline_window_months: 12,
            min_baseline_observations: 6,
            anomaly_z_threshold: 2.0,
            min_spread: 1.0,
            min_relative_spread: 0.05,
            rate_ratio_threshold: 0.3,
            trend_slope_threshold: 0.5,
            min_trend_months: 3,
            spc_sigma: 3.0,
            min_spc_months: 6,
            min_seasonal_months: 24,
            min_cohort_size: 5,
            localized_ratio_threshold: 2.0,
            min_localized_events: 3,
            anomaly_retention: 20,
            batch_chunk_size: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Router, context, cost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub classifier_confidence_threshold: f64,
    /// Outreach drafts go straight out instead of into the approval queue.
    pub auto_send_outreach: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            classifier_confidence_threshold: 0.7,
            auto_send_outreach: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    /// Activity inside this window keeps full per-event detail.
    pub recent_window_days: i64,
    /// Activity older than this is omitted unless explicitly requested.
    pub retention_days: i64,
    pub chars_per_token: usize,
    /// Per-task budget overrides keyed by task type label.
    pub task_budgets: BTreeMap<String, usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            recent_window_days: 30,
            retention_days: 365,
            chars_per_token: 4,
            task_budgets: BTreeMap::new(),
        }
    }
}

/// How often cost counters reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCycle {
    Hourly,
    Daily,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimit {
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostConfig {
    pub cycle: CostCycle,
    /// Per-scope limits by tier. Tiers without an entry are unlimited.
    pub limits: BTreeMap<Tier, TierLimit>,
}

impl Default for CostConfig {
    fn default() -> Self {
        let mut limits = BTreeMap::new();
        limits.insert(Tier::Model, TierLimit { soft: 5_000, hard: 10_000 });
        limits.insert(Tier::LanguageLight, TierLimit { soft: 400, hard: 500 });
        limits.insert(Tier::LanguageStandard, TierLimit { soft: 40, hard: 50 });
        limits.insert(Tier::LanguagePremium, TierLimit { soft: 4, hard: 5 });
        Self {
            cycle: CostCycle::Daily,
            limits,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub sentiment: SentimentConfig,
    pub analysis: AnalysisConfig,
    pub router: RouterConfig,
    pub context: ContextConfig,
    pub cost: CostConfig,
    pub tiers: TierCeilings,
    pub schedule: BatchSchedule,
    /// Path to a custom registry/rule preset. The embedded preset is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset_path: Option<PathBuf>,
    /// SQLite database location. Defaults to `~/.propintel/propintel.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf, PipelineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| PipelineError::Config("Could not find home directory".to_string()))?;
        Ok(home.join(".propintel").join("config.json"))
    }

    /// Load `~/.propintel/config.json`, falling back to defaults when absent.
    pub fn load() -> Result<Config, PipelineError> {
        let path = Self::default_path()?;
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Config, PipelineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("Failed to read config: {}", e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations that would break banding or budgeting.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let b = &self.sentiment.bands;
        if !(b.positive_above > b.mixed_above && b.mixed_above > b.concerning_above) {
            return Err(PipelineError::Config(
                "sentiment bands must be strictly decreasing".to_string(),
            ));
        }
        if self.analysis.min_baseline_observations == 0 {
            return Err(PipelineError::Config(
                "minBaselineObservations must be at least 1".to_string(),
            ));
        }
        let a = &self.analysis;
        if !(a.min_spread.is_finite() && a.min_spread > 0.0)
            || !(a.min_relative_spread.is_finite() && a.min_relative_spread >= 0.0)
        {
            return Err(PipelineError::Config(
                "minSpread must be positive and minRelativeSpread non-negative".to_string(),
            ));
        }
        for (name, days) in [
            ("recentWindowDays", self.context.recent_window_days),
            ("retentionDays", self.context.retention_days),
        ] {
            if days <= 0 || days > MAX_WINDOW_DAYS {
                return Err(PipelineError::Config(format!(
                    "{} must be between 1 and {}",
                    name, MAX_WINDOW_DAYS
                )));
            }
        }
        if self.context.chars_per_token == 0 {
            return Err(PipelineError::Config("charsPerToken must be positive".to_string()));
        }
        self.schedule.validate()?;
        for (tier, limit) in &self.cost.limits {
            if limit.soft > limit.hard {
                return Err(PipelineError::Config(format!(
                    "soft limit above hard limit for {}",
                    tier
                )));
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> Result<PathBuf, PipelineError> {
        match &self.database_path {
            Some(p) => Ok(p.clone()),
            None => {
                let home = dirs::home_dir().ok_or_else(|| {
                    PipelineError::Config("Could not find home directory".to_string())
                })?;
                Ok(home.join(".propintel").join("propintel.db"))
            }
        }
    }
}
