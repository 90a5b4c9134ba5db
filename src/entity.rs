//! Entity references into the external property-management domain model.
//!
//! The pipeline never dereferences an entity beyond its type and id. An
//! `EntityProfile` carries the few structural attributes the batch path
//! needs (property membership, sub-unit, cohort segment, active flag) so
//! that SPC, cohort ranking and absence scans can group entities.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of entity a signal can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Unit,
    Property,
    Lease,
    Vendor,
    WorkOrder,
    Other,
}

impl EntityType {
    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Unit => "unit",
            EntityType::Property => "property",
            EntityType::Lease => "lease",
            EntityType::Vendor => "vendor",
            EntityType::WorkOrder => "work_order",
            EntityType::Other => "other",
        }
    }

    /// Parse from SQL string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "person" => EntityType::Person,
            "unit" => EntityType::Unit,
            "property" => EntityType::Property,
            "lease" => EntityType::Lease,
            "vendor" => EntityType::Vendor,
            "work_order" => EntityType::WorkOrder,
            _ => EntityType::Other,
        }
    }
}

/// Opaque key into the external domain model.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn property(id: impl Into<String>) -> Self {
        Self::new(EntityType::Property, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type.as_str(), self.entity_id)
    }
}

/// Structural attributes of a registered entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityProfile {
    pub entity: EntityRef,
    /// Property this entity belongs to, if any (units, residents, leases).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<String>,
    /// Sub-unit grouping inside a property (building, floor, wing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_unit: Option<String>,
    /// Cohort segment used for percentile ranking and seasonal fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

fn default_active() -> bool {
    true
}

impl EntityProfile {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            property_id: None,
            sub_unit: None,
            segment: None,
            active: true,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, property_id: impl Into<String>) -> Self {
        self.property_id = Some(property_id.into());
        self
    }

    pub fn with_sub_unit(mut self, sub_unit: impl Into<String>) -> Self {
        self.sub_unit = Some(sub_unit.into());
        self
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_roundtrips_through_label() {
        for t in [
            EntityType::Person,
            EntityType::Unit,
            EntityType::Property,
            EntityType::Lease,
            EntityType::Vendor,
            EntityType::WorkOrder,
        ] {
            assert_eq!(EntityType::from_str_lossy(t.as_str()), t);
        }
        assert_eq!(EntityType::from_str_lossy("spaceship"), EntityType::Other);
    }

    #[test]
    fn test_entity_ref_display() {
        let r = EntityRef::new(EntityType::WorkOrder, "wo-17");
        assert_eq!(r.to_string(), "work_order:wo-17");
    }

    #[test]
    fn test_profile_defaults_active_when_missing() {
        let json = r#"{"entity":{"entityType":"unit","entityId":"u-1"},"propertyId":"prop-1"}"#;
        let profile: EntityProfile = serde_json::from_str(json).expect("parse");
        assert!(profile.active);
        assert_eq!(profile.property_id.as_deref(), Some("prop-1"));
    }
}
