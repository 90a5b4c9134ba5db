//! Composite sentiment over an entity's category counters.
//!
//! Category score: Σ weight_value(w) · count[w][p] · polarity_multiplier(p).
//! Overall score: category scores combined with per-category weights and
//! normalized by the weighted signal total, so the result is an average
//! contribution per signal. An entity with no signals scores 0 (mixed).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::bus::{Polarity, SignalWeight};
use crate::store::summary::CategoryCounters;
use crate::types::{SentimentBands, SentimentConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    #[default]
    Mixed,
    Concerning,
    Critical,
}

impl SentimentLabel {
    /// Exactly one band applies to any finite score.
    pub fn from_score(score: f64, bands: &SentimentBands) -> Self {
        if score > bands.positive_above {
            SentimentLabel::Positive
        } else if score > bands.mixed_above {
            SentimentLabel::Mixed
        } else if score > bands.concerning_above {
            SentimentLabel::Concerning
        } else {
            SentimentLabel::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Mixed => "mixed",
            SentimentLabel::Concerning => "concerning",
            SentimentLabel::Critical => "critical",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw weighted score for one category.
pub fn category_score(counters: &CategoryCounters, config: &SentimentConfig) -> f64 {
    let mut score = 0.0;
    for weight in SignalWeight::ALL {
        let wv = config.weight_values.value(weight);
        for polarity in Polarity::ALL {
            let n = counters.count(weight, polarity);
            if n > 0 {
                score += wv * n as f64 * config.polarity_multipliers.multiplier(polarity);
            }
        }
    }
    score
}

/// Normalized overall score across categories.
pub fn overall_score(
    categories: &BTreeMap<String, CategoryCounters>,
    config: &SentimentConfig,
) -> f64 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (category, counters) in categories {
        let cw = config.category_weight(category);
        numerator += cw * category_score(counters, config);
        denominator += cw * counters.total as f64;
    }
    if denominator <= 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Score and band in one step.
pub fn assess(
    categories: &BTreeMap<String, CategoryCounters>,
    config: &SentimentConfig,
) -> (f64, SentimentLabel) {
    let score = overall_score(categories, config);
    (score, SentimentLabel::from_score(score, &config.bands))
}
