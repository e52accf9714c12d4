//! Next-step computation
//!
//! Moves a table from its current assignment toward the target one step at a
//! time. Each step keeps at least `min_available` replicas of every segment on
//! servers that already host it, and with batching enabled adds at most
//! `batch_size` segments to any single server.

use std::collections::HashMap;

use tessera_core::{InstanceStateMap, SegmentAssignment};

/// Assignment for the next step.
///
/// Segments missing from the target are left as they are. Segments missing
/// from the current assignment are not re-created.
pub fn next_assignment(
    current: &SegmentAssignment,
    target: &SegmentAssignment,
    min_available: usize,
    batch_size: Option<usize>,
) -> SegmentAssignment {
    let mut added_per_server: HashMap<&str, usize> = HashMap::new();
    let mut next = SegmentAssignment::new();

    for (segment, current_map) in current {
        let Some(target_map) = target.get(segment) else {
            next.insert(segment.clone(), current_map.clone());
            continue;
        };
        let step = next_instance_state_map(current_map, target_map, min_available);

        if let Some(batch_size) = batch_size {
            let added: Vec<&str> = step
                .keys()
                .filter(|instance| !current_map.contains_key(*instance))
                .map(|instance| instance.as_str())
                .collect();
            let over_budget = added
                .iter()
                .any(|instance| added_per_server.get(instance).copied().unwrap_or(0) >= batch_size);
            if over_budget {
                next.insert(segment.clone(), current_map.clone());
                continue;
            }
            for instance in added {
                // Borrow from `target`, which outlives the map
                if let Some((key, _)) = target_map.get_key_value(instance) {
                    *added_per_server.entry(key.as_str()).or_insert(0) += 1;
                }
            }
        }
        next.insert(segment.clone(), step);
    }
    next
}

/// One step for a single segment: common instances, then current instances
/// up to the availability floor, then target instances up to the target size
fn next_instance_state_map(
    current: &InstanceStateMap,
    target: &InstanceStateMap,
    min_available: usize,
) -> InstanceStateMap {
    // Never keep so many old replicas that the step cannot add a new one
    let min_available = min_available.min(target.len().saturating_sub(1));

    let mut next: InstanceStateMap = target
        .iter()
        .filter(|(instance, _)| current.contains_key(*instance))
        .map(|(instance, state)| (instance.clone(), *state))
        .collect();

    let keep = min_available.saturating_sub(next.len());
    next.extend(
        current
            .iter()
            .filter(|(instance, _)| !target.contains_key(*instance))
            .take(keep)
            .map(|(instance, state)| (instance.clone(), *state)),
    );

    let add = target.len().saturating_sub(next.len());
    next.extend(
        target
            .iter()
            .filter(|(instance, _)| !current.contains_key(*instance))
            .take(add)
            .map(|(instance, state)| (instance.clone(), *state)),
    );
    next
}

/// Whether every segment of the target is in place
pub fn reached_target(current: &SegmentAssignment, target: &SegmentAssignment) -> bool {
    target
        .iter()
        .all(|(segment, target_map)| match current.get(segment) {
            Some(current_map) => current_map == target_map,
            None => true,
        })
}
