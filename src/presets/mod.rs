//! Registry, metric extraction and escalation-rule presets.
//!
//! A preset is the whole classification vocabulary for one kind of
//! portfolio. The default ships embedded in the binary; a config can point
//! at a custom file instead.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::signals::classifier::{MetricSpec, RegistryEntry, SignalRegistry};
use crate::signals::rules::EscalationRule;

pub mod embedded;
pub mod loader;

pub use loader::{load_custom_preset, load_preset, validate_preset};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub registry: Vec<RegistryEntry>,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    pub rules: Vec<EscalationRule>,
    /// Category weights for the overall sentiment score. Config entries win.
    #[serde(default)]
    pub category_weights: BTreeMap<String, f64>,
}

impl Preset {
    pub fn signal_registry(&self) -> SignalRegistry {
        SignalRegistry::new(self.registry.clone(), self.metrics.clone())
    }
}
