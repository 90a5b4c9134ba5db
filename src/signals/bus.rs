//! Signal vocabulary shared by the event path and the batch path.
//!
//! A `DomainEvent` arrives from the external event stream. The classifier
//! turns it into an immutable `SignalEvent` carrying category, weight and
//! polarity plus any metric observations extracted from its fields.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;
use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Weight and polarity
// ---------------------------------------------------------------------------

/// Signal strength, ordered weak < moderate < strong < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalWeight {
    Weak,
    Moderate,
    Strong,
    Critical,
}

impl SignalWeight {
    pub const ALL: [SignalWeight; 4] = [
        SignalWeight::Weak,
        SignalWeight::Moderate,
        SignalWeight::Strong,
        SignalWeight::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalWeight::Weak => "weak",
            SignalWeight::Moderate => "moderate",
            SignalWeight::Strong => "strong",
            SignalWeight::Critical => "critical",
        }
    }

    /// Strict parse; anything outside the four labels is malformed.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weak" => Ok(SignalWeight::Weak),
            "moderate" => Ok(SignalWeight::Moderate),
            "strong" => Ok(SignalWeight::Strong),
            "critical" => Ok(SignalWeight::Critical),
            _ => Err(ValidationError::MalformedWeight(s.to_string())),
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for SignalWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Negative,
    Neutral,
    Positive,
}

impl Polarity {
    pub const ALL: [Polarity; 3] = [Polarity::Negative, Polarity::Neutral, Polarity::Positive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Polarity::Negative => "negative",
            Polarity::Neutral => "neutral",
            Polarity::Positive => "positive",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "negative" => Ok(Polarity::Negative),
            "neutral" => Ok(Polarity::Neutral),
            "positive" => Ok(Polarity::Positive),
            _ => Err(ValidationError::MalformedPolarity(s.to_string())),
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Metric families
// ---------------------------------------------------------------------------

/// Metric families profiled by the statistical engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFamily {
    /// Days between due date and payment.
    PaymentTiming,
    PaymentAmount,
    /// Maintenance requests per month.
    MaintenanceRate,
    /// Replies per month to outbound communication.
    Responsiveness,
}

/// Level metrics are checked by z-score, rate metrics by ratio to baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Level,
    Rate,
}

impl MetricFamily {
    pub const ALL: [MetricFamily; 4] = [
        MetricFamily::PaymentTiming,
        MetricFamily::PaymentAmount,
        MetricFamily::MaintenanceRate,
        MetricFamily::Responsiveness,
    ];

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricFamily::PaymentTiming | MetricFamily::PaymentAmount => MetricKind::Level,
            MetricFamily::MaintenanceRate | MetricFamily::Responsiveness => MetricKind::Rate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFamily::PaymentTiming => "payment_timing",
            MetricFamily::PaymentAmount => "payment_amount",
            MetricFamily::MaintenanceRate => "maintenance_rate",
            MetricFamily::Responsiveness => "responsiveness",
        }
    }

    pub fn from_str_lossy(s: &str) -> Option<Self> {
        MetricFamily::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric sample carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricObservation {
    pub metric: MetricFamily,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Raw event from the external stream: `{event_type, entity_refs[], fields}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub event_type: String,
    pub entity_refs: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl DomainEvent {
    pub fn new(event_type: &str, entity_refs: Vec<EntityRef>) -> Self {
        Self {
            id: None,
            event_type: event_type.to_string(),
            entity_refs,
            occurred_at: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

/// A classified signal. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub entity_refs: Vec<EntityRef>,
    pub category: String,
    pub weight: SignalWeight,
    pub polarity: Polarity,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<MetricObservation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_ordering() {
        assert!(SignalWeight::Weak < SignalWeight::Moderate);
        assert!(SignalWeight::Moderate < SignalWeight::Strong);
        assert!(SignalWeight::Strong < SignalWeight::Critical);
    }

    #[test]
    fn test_weight_parse_rejects_unknown() {
        assert_eq!(SignalWeight::parse(" Strong ").unwrap(), SignalWeight::Strong);
        assert!(matches!(
            SignalWeight::parse("severe"),
            Err(ValidationError::MalformedWeight(_))
        ));
    }

    #[test]
    fn test_polarity_parse_rejects_unknown() {
        assert_eq!(Polarity::parse("positive").unwrap(), Polarity::Positive);
        assert!(matches!(
            Polarity::parse("meh"),
            Err(ValidationError::MalformedPolarity(_))
        ));
    }

    #[test]
    fn test_metric_kinds() {
        assert_eq!(MetricFamily::PaymentTiming.kind(), MetricKind::Level);
        assert_eq!(MetricFamily::MaintenanceRate.kind(), MetricKind::Rate);
        assert_eq!(
            MetricFamily::from_str_lossy("responsiveness"),
            Some(MetricFamily::Responsiveness)
        );
        assert_eq!(MetricFamily::from_str_lossy("vibes"), None);
    }

    #[test]
    fn test_domain_event_deserializes_without_timestamp() {
        let json = r#"{
            "eventType": "rent_payment",
            "entityRefs": [{"entityType": "person", "entityId": "p-1"}],
            "fields": {"daysLate": 12}
        }"#;
        let event: DomainEvent = serde_json::from_str(json).expect("parse");
        assert!(event.occurred_at.is_none());
        assert_eq!(event.fields.get("daysLate").and_then(|v| v.as_i64()), Some(12));
    }
}
