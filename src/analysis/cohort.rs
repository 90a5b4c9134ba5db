//! Percentile rank of an entity's metric within its segment.

use std::collections::BTreeMap;

use super::stats;
use crate::entity::EntityRef;

/// Rank every member of one segment. Segments smaller than `min_size`
/// produce nothing, so percentiles are never computed over a handful of peers.
pub fn rank_segment(members: &[(EntityRef, f64)], min_size: usize) -> BTreeMap<EntityRef, f64> {
    if members.len() < min_size.max(1) {
        return BTreeMap::new();
    }
    let population: Vec<f64> = members.iter().map(|(_, v)| *v).collect();
    members
        .iter()
        .filter_map(|(entity, value)| {
            stats::percentile_rank(*value, &population).map(|p| (entity.clone(), p))
        })
        .collect()
}
