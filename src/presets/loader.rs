use std::collections::HashSet;

use super::embedded;
use super::Preset;
use crate::signals::rules::{RulePredicate, MAX_WINDOW_DAYS};

/// Load an embedded preset by id.
pub fn load_preset(id: &str) -> Result<Preset, String> {
    if let Some(json) = embedded::get_embedded(id) {
        let preset: Preset = serde_json::from_str(json)
            .map_err(|e| format!("Failed to parse embedded preset '{}': {}", id, e))?;
        validate_preset(&preset)?;
        return Ok(preset);
    }
    Err(format!("Unknown preset: {}", id))
}

/// Load a custom preset from a file path. Unknown weight or polarity labels
/// fail here, at parse time.
pub fn load_custom_preset(path: &std::path::Path) -> Result<Preset, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read preset file: {}", e))?;
    let preset: Preset =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse preset: {}", e))?;
    validate_preset(&preset)?;
    Ok(preset)
}

/// Validate a preset has required fields and rules that can ever fire.
pub fn validate_preset(preset: &Preset) -> Result<(), String> {
    if preset.id.trim().is_empty() {
        return Err("Preset id is required".into());
    }
    if preset.name.trim().is_empty() {
        return Err("Preset name is required".into());
    }
    if preset.registry.is_empty() {
        return Err("Preset registry is empty".into());
    }

    let mut categories = HashSet::new();
    for entry in &preset.registry {
        if entry.event_type.trim().is_empty() || entry.category.trim().is_empty() {
            return Err("Registry entries need an event type and a category".into());
        }
        categories.insert(entry.category.as_str());
    }

    let mut rule_ids = HashSet::new();
    for rule in &preset.rules {
        if rule.rule_id.trim().is_empty() {
            return Err("Rule id is required".into());
        }
        if !rule_ids.insert(rule.rule_id.as_str()) {
            return Err(format!("Duplicate rule id: {}", rule.rule_id));
        }
        for condition in rule.predicate.count_conditions() {
            if condition.count == 0 {
                return Err(format!("Rule {}: count must be positive", rule.rule_id));
            }
            check_window(&rule.rule_id, condition.window_days)?;
            if !categories.contains(condition.category.as_str()) {
                return Err(format!(
                    "Rule {}: no registry entry emits category {}",
                    rule.rule_id, condition.category
                ));
            }
        }
        if let RulePredicate::Absence { window_days, .. } = &rule.predicate {
            check_window(&rule.rule_id, *window_days)?;
        }
    }

    for (category, weight) in &preset.category_weights {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(format!("Invalid weight for category {}", category));
        }
    }
    Ok(())
}

fn check_window(rule_id: &str, window_days: i64) -> Result<(), String> {
    if window_days <= 0 || window_days > MAX_WINDOW_DAYS {
        return Err(format!(
            "Rule {}: windowDays must be between 1 and {}",
            rule_id, MAX_WINDOW_DAYS
        ));
    }
    Ok(())
}

/// List all available embedded presets as (id, name, description).
pub fn get_available_presets() -> Vec<(String, String, String)> {
    embedded::list_embedded()
}
