//! Portfolio index pre-sorted by sentiment score.
//!
//! Kept in step with every committed summary change so screening a
//! portfolio is a single ordered walk instead of a sort.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::entity::{EntityProfile, EntityRef, EntityType};

/// Total-ordered wrapper for an f64 score.
#[derive(Debug, Clone, Copy)]
pub struct ScoreKey(pub f64);

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Which entities a portfolio read covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PortfolioScope {
    All,
    Property(String),
    Segment(String),
    EntityType(EntityType),
}

impl PortfolioScope {
    pub fn admits(&self, profile: &EntityProfile) -> bool {
        match self {
            PortfolioScope::All => true,
            PortfolioScope::Property(id) => {
                profile.property_id.as_deref() == Some(id.as_str())
                    || (profile.entity.entity_type == EntityType::Property
                        && profile.entity.entity_id == *id)
            }
            PortfolioScope::Segment(s) => profile.segment.as_deref() == Some(s.as_str()),
            PortfolioScope::EntityType(t) => profile.entity.entity_type == *t,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioSort {
    /// Worst sentiment first.
    #[default]
    SentimentAscending,
    SentimentDescending,
}

#[derive(Debug, Default)]
pub struct PortfolioIndex {
    ordered: BTreeSet<(ScoreKey, EntityRef)>,
    current: HashMap<EntityRef, ScoreKey>,
}

impl PortfolioIndex {
    /// Insert or move an entity to its new score.
    pub fn upsert(&mut self, entity: &EntityRef, score: f64) {
        let key = ScoreKey(score);
        if let Some(old) = self.current.insert(entity.clone(), key) {
            if old == key {
                return;
            }
            self.ordered.remove(&(old, entity.clone()));
        }
        self.ordered.insert((key, entity.clone()));
    }

    pub fn remove(&mut self, entity: &EntityRef) {
        if let Some(old) = self.current.remove(entity) {
            self.ordered.remove(&(old, entity.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Entities in the requested order with their indexed score.
    pub fn ordered(&self, sort: PortfolioSort) -> Box<dyn Iterator<Item = (&EntityRef, f64)> + '_> {
        let iter = self.ordered.iter().map(|(k, e)| (e, k.0));
        match sort {
            PortfolioSort::SentimentAscending => Box::new(iter),
            PortfolioSort::SentimentDescending => Box::new(iter.rev()),
        }
    }
}
