//! Segment Assignment
//!
//! Maps every segment of a table onto servers:
//! - Flat instance partitions: balanced placement of `replication` replicas
//! - Replica groups: one index per segment, mirrored across every group
//! - Strict replica groups: the index is a function of the partition only
//!
//! Existing placements are kept while a server is under its share of the
//! load, so rebalancing an already balanced table changes nothing.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument, warn};

use tessera_core::{
    InstancePartitions, InstancePartitionsType, InstanceStateMap, Result, SegmentAssignment,
    SegmentMetadata, SegmentState, TableConfig, TableType, TesseraError,
};

use crate::tier::{select_tier, SortedTier};

/// Instance partitions of a table by segment type
pub type InstancePartitionsMap = BTreeMap<InstancePartitionsType, InstancePartitions>;

/// A tier together with the instance partitions serving it
#[derive(Debug, Clone)]
pub struct TierPlacement {
    pub tier: SortedTier,
    pub instance_partitions: InstancePartitions,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AssignOptions {
    /// Move consuming segments as well
    pub include_consuming: bool,
    /// Ignore the prior assignment
    pub bootstrap: bool,
    /// Wall clock used for time tiers
    pub now_ms: i64,
}

/// Output of a full table assignment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetAssignment {
    pub assignment: SegmentAssignment,
    /// Tier of every tiered segment
    pub segment_tiers: BTreeMap<String, String>,
}

/// Which placement a segment falls under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Placement {
    Type(InstancePartitionsType),
    Tier(usize),
}

struct SegmentRef<'a> {
    name: &'a str,
    partition: usize,
    consuming: bool,
}

/// Tracks how many servers may end one above the average share
struct CapTracker {
    base: usize,
    extra: usize,
    at_ceil: usize,
}

impl CapTracker {
    fn new(total: usize, slots: usize) -> Self {
        Self {
            base: total / slots,
            extra: total % slots,
            at_ceil: 0,
        }
    }

    /// Whether a slot currently holding `load` may keep one more
    fn try_take(&mut self, load: usize) -> bool {
        if load < self.base {
            true
        } else if load == self.base && self.at_ceil < self.extra {
            self.at_ceil += 1;
            true
        } else {
            false
        }
    }

    fn record(&mut self, load: usize) {
        if load == self.base {
            self.at_ceil += 1;
        }
    }
}

/// Segment assignment for one table
#[derive(Debug, Clone)]
pub struct SegmentAssignmentStrategy {
    table_name: String,
    table_type: TableType,
    replication: usize,
    strict_replica_group: bool,
}

impl SegmentAssignmentStrategy {
    pub fn for_table(config: &TableConfig) -> Self {
        Self {
            table_name: config.table_name.clone(),
            table_type: config.table_type,
            replication: config.replication,
            strict_replica_group: config.routing.strict_replica_group,
        }
    }

    fn state_for(consuming: bool) -> SegmentState {
        if consuming {
            SegmentState::Consuming
        } else {
            SegmentState::Online
        }
    }

    fn instance_partitions_type(&self, consuming: bool, available: &InstancePartitionsMap) -> InstancePartitionsType {
        match self.table_type {
            TableType::Offline => InstancePartitionsType::Offline,
            TableType::Realtime if consuming => InstancePartitionsType::Consuming,
            TableType::Realtime => {
                if available.contains_key(&InstancePartitionsType::Completed) {
                    InstancePartitionsType::Completed
                } else {
                    InstancePartitionsType::Consuming
                }
            }
        }
    }

    fn lookup<'a>(&self, ty: InstancePartitionsType, available: &'a InstancePartitionsMap) -> Result<&'a InstancePartitions> {
        let ip = available.get(&ty).ok_or_else(|| {
            TesseraError::InvalidInstancePartitions(format!(
                "missing {} instance partitions for {}",
                ty, self.table_name
            ))
        })?;
        ip.validate()?;
        Ok(ip)
    }

    /// Servers and state for a newly added segment
    ///
    /// With replica groups the segment's partition picks the partition slot
    /// and one index that is mirrored across every replica group. In strict
    /// mode that index is `(partition / num_partitions) % group_size`, so an
    /// unpartitioned table (every segment in partition 0) puts all of its
    /// segments on index 0 of each replica group and leaves the other
    /// members of the group empty.
    pub fn assign_segment(
        &self,
        segment: &SegmentMetadata,
        current: &SegmentAssignment,
        instance_partitions: &InstancePartitionsMap,
    ) -> Result<InstanceStateMap> {
        let consuming = segment.is_consuming() && self.table_type == TableType::Realtime;
        let ty = self.instance_partitions_type(consuming, instance_partitions);
        let ip = self.lookup(ty, instance_partitions)?;
        let mut load: HashMap<&str, usize> = HashMap::new();
        for instance_state_map in current.values() {
            for instance in instance_state_map.keys() {
                *load.entry(instance.as_str()).or_insert(0) += 1;
            }
        }
        let load_of = |instance: &String| load.get(instance.as_str()).copied().unwrap_or(0);

        let instances: Vec<String> = if ip.is_flat() {
            let candidates = ip.instances(0, 0).unwrap_or(&[]);
            self.check_replication(candidates.len())?;
            let mut order: Vec<usize> = (0..candidates.len()).collect();
            order.sort_by_key(|&idx| (load_of(&candidates[idx]), idx));
            order
                .into_iter()
                .take(self.replication)
                .map(|idx| candidates[idx].clone())
                .collect()
        } else {
            let partition = segment.partition() as usize;
            let lists = self.partition_lists(ip, partition % ip.num_partitions())?;
            let index = if self.strict_replica_group {
                (partition / ip.num_partitions()) % lists[0].len()
            } else {
                (0..lists[0].len())
                    .min_by_key(|&idx| (load_of(&lists[0][idx]), idx))
                    .unwrap_or(0)
            };
            lists.iter().map(|list| list[index].clone()).collect()
        };

        debug!(segment = %segment.name, instances = ?instances, "Assigned new segment");
        Ok(instances
            .into_iter()
            .map(|i| (i, Self::state_for(consuming)))
            .collect())
    }

    /// Target assignment for every segment of the prior assignment
    #[instrument(skip_all, fields(table = %self.table_name, segments = prior.len()))]
    pub fn assign(
        &self,
        segments: &BTreeMap<String, SegmentMetadata>,
        instance_partitions: &InstancePartitionsMap,
        tiers: &[TierPlacement],
        prior: &SegmentAssignment,
        options: AssignOptions,
    ) -> Result<TargetAssignment> {
        let empty = SegmentAssignment::new();
        let baseline = if options.bootstrap { &empty } else { prior };
        let sorted_tiers: Vec<SortedTier> = tiers.iter().map(|t| t.tier.clone()).collect();

        let mut target = TargetAssignment::default();
        let mut groups: BTreeMap<Placement, Vec<SegmentRef>> = BTreeMap::new();

        for (name, current) in prior {
            let metadata = segments.get(name);
            let consuming = self.table_type == TableType::Realtime
                && match metadata {
                    Some(metadata) => metadata.is_consuming(),
                    None => {
                        current.values().any(|s| *s == SegmentState::Consuming)
                            && !current.values().any(|s| *s == SegmentState::Online)
                    }
                };

            if consuming && !options.include_consuming && !options.bootstrap {
                target.assignment.insert(name.clone(), current.clone());
                continue;
            }

            let partition = metadata.map(|m| m.partition() as usize).unwrap_or(0);
            let segment = SegmentRef {
                name: name.as_str(),
                partition,
                consuming,
            };

            let tier = match (consuming, metadata) {
                (false, Some(metadata)) => select_tier(&sorted_tiers, metadata, options.now_ms)
                    .and_then(|t| sorted_tiers.iter().position(|s| s.name() == t.name())),
                _ => None,
            };
            let placement = match tier {
                Some(idx) => {
                    target
                        .segment_tiers
                        .insert(name.clone(), sorted_tiers[idx].name().to_string());
                    Placement::Tier(idx)
                }
                None => Placement::Type(self.instance_partitions_type(consuming, instance_partitions)),
            };
            groups.entry(placement).or_default().push(segment);
        }

        for (placement, group) in &groups {
            let ip = match placement {
                Placement::Type(ty) => self.lookup(*ty, instance_partitions)?,
                Placement::Tier(idx) => &tiers[*idx].instance_partitions,
            };
            let placed = self.place_group(group, ip, baseline)?;
            for segment in group {
                let instances = placed.get(segment.name).cloned().unwrap_or_default();
                let state = Self::state_for(segment.consuming);
                target.assignment.insert(
                    segment.name.to_string(),
                    instances.into_iter().map(|i| (i, state)).collect(),
                );
            }
            debug!(placement = ?placement, segments = group.len(), "Placed segment group");
        }

        Ok(target)
    }

    fn check_replication(&self, available: usize) -> Result<()> {
        if available < self.replication {
            return Err(TesseraError::InsufficientInstances {
                context: format!("{} replication", self.table_name),
                available,
                required: self.replication,
            });
        }
        Ok(())
    }

    fn partition_lists<'a>(&self, ip: &'a InstancePartitions, partition: usize) -> Result<Vec<&'a [String]>> {
        let lists = (0..ip.num_replica_groups())
            .map(|rg| {
                ip.instances(partition, rg).ok_or_else(|| {
                    TesseraError::InvalidInstancePartitions(format!(
                        "{} has no instances for slot ({}, {})",
                        ip.name(),
                        partition,
                        rg
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let size = lists[0].len();
        if lists.iter().any(|l| l.len() != size) {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "replica groups of {} partition {} differ in size",
                ip.name(),
                partition
            )));
        }
        Ok(lists)
    }

    fn place_group(
        &self,
        group: &[SegmentRef],
        ip: &InstancePartitions,
        baseline: &SegmentAssignment,
    ) -> Result<HashMap<String, Vec<String>>> {
        ip.validate()?;
        if ip.is_flat() {
            return self.place_balanced(group, ip.instances(0, 0).unwrap_or(&[]), baseline);
        }
        if ip.num_replica_groups() != self.replication {
            warn!(
                table = %self.table_name,
                replica_groups = ip.num_replica_groups(),
                replication = self.replication,
                "Replica group count differs from replication, using replica groups"
            );
        }

        let mut by_partition: BTreeMap<usize, Vec<&SegmentRef>> = BTreeMap::new();
        for segment in group {
            by_partition
                .entry(segment.partition % ip.num_partitions())
                .or_default()
                .push(segment);
        }

        let mut placed = HashMap::new();
        for (partition, segments) in by_partition {
            let lists = self.partition_lists(ip, partition)?;
            let indices = if self.strict_replica_group {
                // Partition 0 of an unpartitioned table always maps to index 0
                segments
                    .iter()
                    .map(|s| (s.partition / ip.num_partitions()) % lists[0].len())
                    .collect()
            } else {
                Self::balanced_indices(&segments, &lists, baseline)
            };
            for (segment, index) in segments.iter().zip(indices) {
                placed.insert(
                    segment.name.to_string(),
                    lists.iter().map(|list| list[index].clone()).collect(),
                );
            }
        }
        Ok(placed)
    }

    /// One index per segment into the mirrored replica group lists
    fn balanced_indices(segments: &[&SegmentRef], lists: &[&[String]], baseline: &SegmentAssignment) -> Vec<usize> {
        let slots = lists[0].len();
        let mut caps = CapTracker::new(segments.len(), slots);
        let mut load = vec![0usize; slots];
        let mut chosen: Vec<Option<usize>> = Vec::with_capacity(segments.len());

        for segment in segments {
            let current = baseline.get(segment.name);
            let existing = current.and_then(|current| {
                (0..slots)
                    .map(|idx| {
                        let matches = lists
                            .iter()
                            .filter(|list| current.contains_key(&list[idx]))
                            .count();
                        (matches, idx)
                    })
                    .filter(|(matches, _)| *matches > 0)
                    .max_by_key(|&(matches, idx)| (matches, std::cmp::Reverse(idx)))
                    .map(|(_, idx)| idx)
            });
            match existing {
                Some(idx) if caps.try_take(load[idx]) => {
                    load[idx] += 1;
                    chosen.push(Some(idx));
                }
                _ => chosen.push(None),
            }
        }

        chosen
            .into_iter()
            .map(|choice| match choice {
                Some(idx) => idx,
                None => {
                    let idx = (0..slots).min_by_key(|&idx| (load[idx], idx)).unwrap_or(0);
                    caps.record(load[idx]);
                    load[idx] += 1;
                    idx
                }
            })
            .collect()
    }

    /// Spread `replication` replicas of every segment over a flat server list
    fn place_balanced(
        &self,
        group: &[SegmentRef],
        instances: &[String],
        baseline: &SegmentAssignment,
    ) -> Result<HashMap<String, Vec<String>>> {
        self.check_replication(instances.len())?;
        let slots = instances.len();
        let position: HashMap<&str, usize> = instances
            .iter()
            .enumerate()
            .map(|(idx, i)| (i.as_str(), idx))
            .collect();
        let mut caps = CapTracker::new(group.len() * self.replication, slots);
        let mut load = vec![0usize; slots];
        let mut placed: Vec<Vec<usize>> = Vec::with_capacity(group.len());

        for segment in group {
            let mut current: Vec<usize> = baseline
                .get(segment.name)
                .map(|m| m.keys().filter_map(|i| position.get(i.as_str()).copied()).collect())
                .unwrap_or_default();
            current.sort_unstable();
            let mut kept = Vec::with_capacity(self.replication);
            for idx in current {
                if kept.len() >= self.replication {
                    break;
                }
                if caps.try_take(load[idx]) {
                    load[idx] += 1;
                    kept.push(idx);
                }
            }
            placed.push(kept);
        }

        for kept in placed.iter_mut() {
            while kept.len() < self.replication {
                let next = (0..slots)
                    .filter(|idx| !kept.contains(idx))
                    .min_by_key(|&idx| (load[idx], idx));
                match next {
                    Some(idx) => {
                        caps.record(load[idx]);
                        load[idx] += 1;
                        kept.push(idx);
                    }
                    None => break,
                }
            }
        }

        // Even out what the keep pass left lopsided
        loop {
            let max = (0..slots).max_by_key(|&idx| (load[idx], std::cmp::Reverse(idx)));
            let min = (0..slots).min_by_key(|&idx| (load[idx], idx));
            let (Some(max), Some(min)) = (max, min) else { break };
            if load[max] <= load[min] + 1 {
                break;
            }
            let Some(kept) = placed
                .iter_mut()
                .find(|kept| kept.contains(&max) && !kept.contains(&min))
            else {
                break;
            };
            for idx in kept.iter_mut() {
                if *idx == max {
                    *idx = min;
                }
            }
            load[max] -= 1;
            load[min] += 1;
        }

        Ok(group
            .iter()
            .zip(placed)
            .map(|(segment, kept)| {
                (
                    segment.name.to_string(),
                    kept.into_iter().map(|idx| instances[idx].clone()).collect(),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::sort_tiers;
    use proptest::prelude::*;
    use tessera_core::{instance_state_map, TierConfig};

    fn make_servers(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}_{}", prefix, i)).collect()
    }

    fn make_flat(ty: InstancePartitionsType, servers: Vec<String>) -> InstancePartitionsMap {
        let mut map = InstancePartitionsMap::new();
        map.insert(ty, InstancePartitions::single("t", servers).unwrap());
        map
    }

    fn make_segments(n: usize) -> BTreeMap<String, SegmentMetadata> {
        (0..n)
            .map(|i| {
                let name = format!("seg_{}", i);
                (name.clone(), SegmentMetadata::new(name))
            })
            .collect()
    }

    fn make_uniform(segments: &BTreeMap<String, SegmentMetadata>, servers: &[String]) -> SegmentAssignment {
        segments
            .keys()
            .map(|s| (s.clone(), instance_state_map(servers.iter().cloned(), SegmentState::Online)))
            .collect()
    }

    fn moved(current: &SegmentAssignment, target: &SegmentAssignment) -> usize {
        target
            .iter()
            .map(|(segment, instances)| {
                instances
                    .keys()
                    .filter(|i| !current.get(segment).is_some_and(|c| c.contains_key(*i)))
                    .count()
            })
            .sum()
    }

    fn loads(assignment: &SegmentAssignment) -> BTreeMap<String, usize> {
        tessera_core::instance_to_segments(assignment)
            .into_iter()
            .map(|(i, s)| (i, s.len()))
            .collect()
    }

    #[test]
    fn test_balanced_unchanged_pool_is_noop() {
        let table = TableConfig::offline("orders", 3, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let segments = make_segments(10);
        let servers = make_servers("server", 3);
        let current = make_uniform(&segments, &servers);
        let ip = make_flat(InstancePartitionsType::Offline, servers);

        let target = strategy
            .assign(&segments, &ip, &[], &current, AssignOptions::default())
            .unwrap();
        assert_eq!(target.assignment, current);
    }

    #[test]
    fn test_balanced_add_servers_moves_half() {
        let table = TableConfig::offline("orders", 3, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let segments = make_segments(10);
        let current = make_uniform(&segments, &make_servers("server", 3));
        let ip = make_flat(InstancePartitionsType::Offline, make_servers("server", 6));

        let target = strategy
            .assign(&segments, &ip, &[], &current, AssignOptions::default())
            .unwrap()
            .assignment;
        assert_eq!(moved(&current, &target), 15);
        assert!(loads(&target).values().all(|&l| l == 5));
        assert!(target.values().all(|m| m.len() == 3));

        // Stable once balanced
        let again = strategy
            .assign(&segments, &ip, &[], &target, AssignOptions::default())
            .unwrap()
            .assignment;
        assert_eq!(again, target);
    }

    #[test]
    fn test_balanced_repair_evens_out_load() {
        let table = TableConfig::offline("orders", 3, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let segments = make_segments(10);
        let six = make_servers("server", 6);
        let current = strategy
            .assign(
                &segments,
                &make_flat(InstancePartitionsType::Offline, six.clone()),
                &[],
                &make_uniform(&segments, &make_servers("server", 3)),
                AssignOptions::default(),
            )
            .unwrap()
            .assignment;

        let four = make_flat(InstancePartitionsType::Offline, six[..4].to_vec());
        let target = strategy
            .assign(&segments, &four, &[], &current, AssignOptions::default())
            .unwrap()
            .assignment;
        let counts = loads(&target);
        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert!(max - min <= 1, "{:?}", counts);
    }

    #[test]
    fn test_insufficient_servers_for_replication() {
        let table = TableConfig::offline("orders", 3, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let segments = make_segments(2);
        let current = make_uniform(&segments, &make_servers("server", 3));
        let ip = make_flat(InstancePartitionsType::Offline, make_servers("server", 2));
        let err = strategy
            .assign(&segments, &ip, &[], &current, AssignOptions::default())
            .unwrap_err();
        assert!(matches!(err, TesseraError::InsufficientInstances { .. }));
    }

    #[test]
    fn test_tiers_move_only_aged_segments() {
        const DAY_MS: i64 = 24 * 3600 * 1000;
        let now = 1_000 * DAY_MS;
        let mut table = TableConfig::offline("orders", 3, "noTier_OFFLINE");
        table.tiers = vec![
            TierConfig::time("tierA", "7d", "tierA_OFFLINE"),
            TierConfig::time("tierB", "15d", "tierB_OFFLINE"),
            TierConfig::fixed("fixed", &["seg_6", "seg_3", "seg_1"], "noTier_OFFLINE"),
        ];
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let segments: BTreeMap<String, SegmentMetadata> = (0..10)
            .map(|i| {
                let name = format!("seg_{}", i);
                let metadata = SegmentMetadata::new(name.clone()).with_end_time(now - i as i64 * 3 * DAY_MS - 1);
                (name, metadata)
            })
            .collect();
        let no_tier = make_servers("noTier", 3);
        let current = make_uniform(&segments, &no_tier);

        let placements: Vec<TierPlacement> = sort_tiers(&table.tiers)
            .unwrap()
            .into_iter()
            .map(|tier| {
                let servers = make_servers(tier.config.server_tag.trim_end_matches("_OFFLINE"), 3);
                TierPlacement {
                    instance_partitions: InstancePartitions::single(tier.name(), servers).unwrap(),
                    tier,
                }
            })
            .collect();
        let options = AssignOptions {
            now_ms: now,
            ..Default::default()
        };
        let target = strategy
            .assign(&segments, &make_flat(InstancePartitionsType::Offline, no_tier), &placements, &current, options)
            .unwrap();

        assert_eq!(moved(&current, &target.assignment), 15);
        assert_eq!(target.segment_tiers["seg_4"], "tierA");
        for seg in ["seg_5", "seg_7", "seg_8", "seg_9"] {
            assert_eq!(target.segment_tiers[seg], "tierB");
            assert!(target.assignment[seg].keys().all(|i| i.starts_with("tierB")));
        }
        assert_eq!(target.segment_tiers["seg_6"], "fixed");
        assert_eq!(target.assignment["seg_6"], current["seg_6"]);
        assert!(!target.segment_tiers.contains_key("seg_0"));
    }

    fn make_replica_group_ip(groups: usize, per_group: usize, partitions: usize) -> InstancePartitions {
        let mut ip = InstancePartitions::new("t", partitions, groups).unwrap();
        for rg in 0..groups {
            let members: Vec<String> = (0..per_group).map(|i| format!("rg{}_server_{}", rg, i)).collect();
            for p in 0..partitions {
                ip.set_instances(p, rg, members.clone()).unwrap();
            }
        }
        ip
    }

    #[test]
    fn test_replica_group_mirrors_index() {
        let table = TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let mut ip = InstancePartitionsMap::new();
        ip.insert(InstancePartitionsType::Offline, make_replica_group_ip(2, 3, 1));
        let segments = make_segments(9);
        let current: SegmentAssignment = segments.keys().map(|s| (s.clone(), InstanceStateMap::new())).collect();

        let target = strategy
            .assign(&segments, &ip, &[], &current, AssignOptions::default())
            .unwrap()
            .assignment;
        for instances in target.values() {
            let suffixes: Vec<&str> = instances.keys().map(|i| &i[4..]).collect();
            assert_eq!(suffixes.len(), 2);
            assert_eq!(suffixes[0], suffixes[1]);
        }
        assert!(loads(&target).values().all(|&l| l == 3));
    }

    #[test]
    fn test_new_segment_goes_to_least_loaded() {
        let table = TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let ip = make_flat(InstancePartitionsType::Offline, make_servers("server", 3));
        let mut current = SegmentAssignment::new();
        current.insert(
            "seg_0".into(),
            instance_state_map(["server_0", "server_1"], SegmentState::Online),
        );
        let placed = strategy
            .assign_segment(&SegmentMetadata::new("seg_1"), &current, &ip)
            .unwrap();
        assert_eq!(placed.keys().collect::<Vec<_>>(), vec!["server_0", "server_2"]);
    }

    #[test]
    fn test_zero_sized_instance_partitions_rejected() {
        let table = TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE");
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let corrupted: InstancePartitions = serde_json::from_value(serde_json::json!({
            "name": "orders_OFFLINE",
            "numPartitions": 0,
            "numReplicaGroups": 2,
            "partitionToInstances": {}
        }))
        .unwrap();
        let mut ip = InstancePartitionsMap::new();
        ip.insert(InstancePartitionsType::Offline, corrupted);
        let segments = make_segments(4);
        let current: SegmentAssignment = segments.keys().map(|s| (s.clone(), InstanceStateMap::new())).collect();

        let result = strategy.assign(&segments, &ip, &[], &current, AssignOptions::default());
        assert!(matches!(result, Err(TesseraError::InvalidInstancePartitions(_))));
        let result = strategy.assign_segment(&SegmentMetadata::new("seg_9"), &current, &ip);
        assert!(matches!(result, Err(TesseraError::InvalidInstancePartitions(_))));
    }

    #[test]
    fn test_consuming_segments_frozen_by_default() {
        let table = TableConfig::realtime("events", 1, "DefaultTenant_REALTIME", 1);
        let strategy = SegmentAssignmentStrategy::for_table(&table);
        let mut segments = make_segments(2);
        segments.insert("seg_c".into(), SegmentMetadata::new("seg_c").consuming(0));
        let mut current = make_uniform(&segments, &make_servers("old", 1));
        current.insert("seg_c".into(), instance_state_map(["old_0"], SegmentState::Consuming));
        let ip = make_flat(InstancePartitionsType::Consuming, make_servers("new", 1));

        let frozen = strategy
            .assign(&segments, &ip, &[], &current, AssignOptions::default())
            .unwrap()
            .assignment;
        assert_eq!(frozen["seg_c"], current["seg_c"]);
        assert!(frozen["seg_0"].contains_key("new_0"));

        let options = AssignOptions {
            include_consuming: true,
            ..Default::default()
        };
        let moved = strategy.assign(&segments, &ip, &[], &current, options).unwrap().assignment;
        assert_eq!(moved["seg_c"]["new_0"], SegmentState::Consuming);
    }

    proptest! {
        #[test]
        fn prop_strict_partition_shares_servers(
            partitions in 1usize..6,
            segments_per_partition in 1usize..6,
            per_group in 1usize..4,
        ) {
            let mut table = TableConfig::offline("orders", 3, "DefaultTenant_OFFLINE");
            table.routing.strict_replica_group = true;
            let strategy = SegmentAssignmentStrategy::for_table(&table);
            let mut ip = InstancePartitionsMap::new();
            ip.insert(InstancePartitionsType::Offline, make_replica_group_ip(3, per_group, 2));

            let mut segments = BTreeMap::new();
            let mut current = SegmentAssignment::new();
            for p in 0..partitions {
                for s in 0..segments_per_partition {
                    let name = format!("seg_{}_{}", p, s);
                    segments.insert(name.clone(), SegmentMetadata::new(name.clone()).with_partition(p as u32));
                    current.insert(name, InstanceStateMap::new());
                }
            }
            let target = strategy.assign(&segments, &ip, &[], &current, AssignOptions::default()).unwrap().assignment;
            for p in 0..partitions {
                let first = &target[&format!("seg_{}_0", p)];
                prop_assert_eq!(first.len(), 3);
                for s in 1..segments_per_partition {
                    let keys: Vec<&String> = target[&format!("seg_{}_{}", p, s)].keys().collect();
                    prop_assert_eq!(keys, first.keys().collect::<Vec<_>>());
                }
            }
        }

        #[test]
        fn prop_balanced_rebalance_is_even_and_idempotent(
            num_segments in 1usize..40,
            replication in 1usize..4,
            before in 1usize..8,
            after in 1usize..8,
        ) {
            prop_assume!(before >= replication && after >= replication);
            let table = TableConfig::offline("orders", replication, "DefaultTenant_OFFLINE");
            let strategy = SegmentAssignmentStrategy::for_table(&table);
            let segments = make_segments(num_segments);
            let empty: SegmentAssignment = segments.keys().map(|s| (s.clone(), InstanceStateMap::new())).collect();

            let initial = strategy
                .assign(&segments, &make_flat(InstancePartitionsType::Offline, make_servers("server", before)), &[], &empty, AssignOptions::default())
                .unwrap()
                .assignment;
            let ip = make_flat(InstancePartitionsType::Offline, make_servers("server", after));
            let target = strategy.assign(&segments, &ip, &[], &initial, AssignOptions::default()).unwrap().assignment;

            prop_assert!(target.values().all(|m| m.len() == replication));
            let counts = loads(&target);
            let max = counts.values().max().copied().unwrap_or(0);
            let min = if counts.len() < after { 0 } else { counts.values().min().copied().unwrap_or(0) };
            prop_assert!(max - min <= 1);

            let again = strategy.assign(&segments, &ip, &[], &target, AssignOptions::default()).unwrap().assignment;
            prop_assert_eq!(again, target);
        }
    }
}
