//! Token estimation and per-task packet profiles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{ContextConfig, Tier, TierCeilings};

/// Estimated tokens for `text`: characters over `chars_per_token`, rounded up.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(chars_per_token.max(1))
}

/// Fixed inclusion rules and declared budget for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProfile {
    pub task_type: String,
    pub budget_tokens: usize,
    /// Categories kept in detail when compressing. Empty means all.
    #[serde(default)]
    pub focus_categories: Vec<String>,
    #[serde(default = "default_true")]
    pub include_anomalies: bool,
    #[serde(default = "default_true")]
    pub include_model_outputs: bool,
}

fn default_true() -> bool {
    true
}

impl TaskProfile {
    fn new(task_type: &str, budget_tokens: usize, focus: &[&str]) -> Self {
        Self {
            task_type: task_type.to_string(),
            budget_tokens,
            focus_categories: focus.iter().map(|c| c.to_string()).collect(),
            include_anomalies: true,
            include_model_outputs: true,
        }
    }

    pub fn is_focus(&self, category: &str) -> bool {
        self.focus_categories.is_empty() || self.focus_categories.iter().any(|c| c == category)
    }
}

/// Built-in task profiles keyed by task type.
pub fn default_profiles() -> BTreeMap<String, TaskProfile> {
    let mut profiles = BTreeMap::new();
    for profile in [
        TaskProfile::new("outreach_draft", 2_000, &["financial", "communication"]),
        TaskProfile::new("message_classification", 1_500, &["communication"]),
        TaskProfile::new("intervention_plan", 30_000, &[]),
        TaskProfile::new("portfolio_synthesis", 30_000, &[]),
        TaskProfile::new("strategy_review", 60_000, &[]),
    ] {
        profiles.insert(profile.task_type.clone(), profile);
    }
    profiles
}

/// Effective budget: the task's declared budget (or its configured override),
/// never above the tier's input ceiling.
pub fn resolve_budget(
    profile: &TaskProfile,
    tier: Tier,
    config: &ContextConfig,
    ceilings: &TierCeilings,
) -> Result<usize, PipelineError> {
    let declared = config
        .task_budgets
        .get(&profile.task_type)
        .copied()
        .unwrap_or(profile.budget_tokens);
    let budget = match ceilings.for_tier(tier) {
        Some(ceiling) => declared.min(ceiling.max_input_tokens),
        None => declared,
    };
    if budget == 0 {
        return Err(PipelineError::Config(format!(
            "zero token budget for task {}",
            profile.task_type
        )));
    }
    Ok(budget)
}
