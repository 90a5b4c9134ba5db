//! Registry-driven signal classification.
//!
//! Maps a domain event to {category, weight, polarity} by looking up its
//! event type and testing each entry's field predicate in declaration order.
//! First match wins. Pure lookup over the registry, no I/O.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bus::{DomainEvent, MetricFamily, MetricObservation, Polarity, SignalEvent, SignalWeight};
use crate::error::ValidationError;

/// Field test applied to an event's `fields` map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldPredicate {
    #[default]
    Always,
    Equals {
        field: String,
        value: serde_json::Value,
    },
    GreaterThan {
        field: String,
        threshold: f64,
    },
    AtMost {
        field: String,
        threshold: f64,
    },
    Present {
        field: String,
    },
}

impl FieldPredicate {
    pub fn matches(&self, fields: &serde_json::Map<String, serde_json::Value>) -> bool {
        match self {
            FieldPredicate::Always => true,
            FieldPredicate::Equals { field, value } => fields.get(field) == Some(value),
            FieldPredicate::GreaterThan { field, threshold } => fields
                .get(field)
                .and_then(|v| v.as_f64())
                .is_some_and(|v| v > *threshold),
            FieldPredicate::AtMost { field, threshold } => fields
                .get(field)
                .and_then(|v| v.as_f64())
                .is_some_and(|v| v <= *threshold),
            FieldPredicate::Present { field } => {
                fields.get(field).is_some_and(|v| !v.is_null())
            }
        }
    }
}

/// One classification row keyed by event type + field predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub event_type: String,
    #[serde(default)]
    pub predicate: FieldPredicate,
    pub category: String,
    pub weight: SignalWeight,
    pub polarity: Polarity,
}

/// Numeric field on an event type that feeds a metric family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    pub event_type: String,
    pub field: String,
    pub metric: MetricFamily,
}

/// Immutable lookup table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    by_event_type: HashMap<String, Vec<RegistryEntry>>,
    metrics_by_event_type: HashMap<String, Vec<MetricSpec>>,
}

impl SignalRegistry {
    pub fn new(entries: Vec<RegistryEntry>, metrics: Vec<MetricSpec>) -> Self {
        let mut by_event_type: HashMap<String, Vec<RegistryEntry>> = HashMap::new();
        for entry in entries {
            by_event_type
                .entry(entry.event_type.clone())
                .or_default()
                .push(entry);
        }
        let mut metrics_by_event_type: HashMap<String, Vec<MetricSpec>> = HashMap::new();
        for spec in metrics {
            metrics_by_event_type
                .entry(spec.event_type.clone())
                .or_default()
                .push(spec);
        }
        Self {
            by_event_type,
            metrics_by_event_type,
        }
    }

    /// Every category the registry can emit.
    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .by_event_type
            .values()
            .flatten()
            .map(|e| e.category.clone())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }

    /// Resolve the first registry entry matching this event.
    pub fn lookup(&self, event: &DomainEvent) -> Option<&RegistryEntry> {
        self.by_event_type
            .get(&event.event_type)?
            .iter()
            .find(|entry| entry.predicate.matches(&event.fields))
    }

    /// Classify a domain event into an immutable signal.
    ///
    /// `received_at` stands in for `occurred_at` when the event carries none.
    pub fn classify(
        &self,
        event: &DomainEvent,
        received_at: DateTime<Utc>,
    ) -> Result<SignalEvent, ValidationError> {
        if event.entity_refs.is_empty() {
            return Err(ValidationError::NoEntities);
        }
        let entry = self
            .lookup(event)
            .ok_or_else(|| ValidationError::Unclassifiable {
                event_type: event.event_type.clone(),
            })?;

        let observations = self.extract_observations(event)?;

        Ok(SignalEvent {
            id: event
                .id
                .clone()
                .unwrap_or_else(|| format!("sig-{}", Uuid::new_v4())),
            event_type: event.event_type.clone(),
            occurred_at: event.occurred_at.unwrap_or(received_at),
            entity_refs: event.entity_refs.clone(),
            category: entry.category.clone(),
            weight: entry.weight,
            polarity: entry.polarity,
            payload: serde_json::Value::Object(event.fields.clone()),
            observations,
        })
    }

    fn extract_observations(
        &self,
        event: &DomainEvent,
    ) -> Result<Vec<MetricObservation>, ValidationError> {
        let Some(specs) = self.metrics_by_event_type.get(&event.event_type) else {
            return Ok(Vec::new());
        };
        let mut observations = Vec::new();
        for spec in specs {
            match event.fields.get(&spec.field) {
                None | Some(serde_json::Value::Null) => continue,
                Some(v) => {
                    let value = v.as_f64().filter(|x| x.is_finite()).ok_or_else(|| {
                        ValidationError::MalformedEvent(format!(
                            "field {} must be numeric for {}",
                            spec.field, spec.metric
                        ))
                    })?;
                    observations.push(MetricObservation {
                        metric: spec.metric,
                        value,
                    });
                }
            }
        }
        Ok(observations)
    }
}
