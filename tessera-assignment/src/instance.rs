//! Instance Assignment
//!
//! Computes instance partitions from a tag pool:
//! - Flat pool: a single slot holding every server
//! - Replica groups: servers dealt round-robin into groups, then partitions
//!   dealt round-robin within each group
//! - Minimize data movement: prior group membership and partition slots are
//!   kept where the server is still pooled; only freed slots are refilled,
//!   lowest load first, then lowest id

use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

use tessera_core::{
    InstanceAssignmentConfig, InstanceConfig, InstancePartitions, InstancePartitionsType,
    PartitionSelector, ReplicaGroupPartitionConfig, Result, TableConfig, TesseraError, TierConfig,
};

/// Sorted ids of enabled servers carrying `tag`
pub fn tag_pool(instances: &[InstanceConfig], tag: &str) -> Result<Vec<String>> {
    let mut pool: Vec<String> = instances
        .iter()
        .filter(|i| i.enabled && i.has_tag(tag))
        .map(|i| i.id.clone())
        .collect();
    if pool.is_empty() {
        return Err(TesseraError::EmptyInstancePool {
            tag: tag.to_string(),
        });
    }
    pool.sort();
    pool.dedup();
    Ok(pool)
}

/// Computes instance partitions for one table
pub struct InstanceAssignmentDriver<'a> {
    table_config: &'a TableConfig,
}

impl<'a> InstanceAssignmentDriver<'a> {
    pub fn new(table_config: &'a TableConfig) -> Self {
        Self { table_config }
    }

    /// Instance partitions for one segment type.
    ///
    /// `minimize` overrides the config's `minimizeDataMovement` flag when set.
    #[instrument(skip(self, instances, prior), fields(table = %self.table_config.table_name))]
    pub fn assign(
        &self,
        ty: InstancePartitionsType,
        instances: &[InstanceConfig],
        prior: Option<&InstancePartitions>,
        minimize: Option<bool>,
    ) -> Result<InstancePartitions> {
        let name = ty.instance_partitions_name(&self.table_config.table_name);
        let (tag, config, config_minimize) = match self.table_config.instance_assignment_config(ty) {
            Some(assignment) => (
                assignment.tag.as_str(),
                self.resolve(assignment)?,
                assignment.minimize_data_movement,
            ),
            None => (
                self.table_config.server_tag.as_str(),
                ReplicaGroupPartitionConfig::default(),
                false,
            ),
        };
        let pool = tag_pool(instances, tag)?;
        let minimize = minimize.unwrap_or(config_minimize);
        compute_instance_partitions(&name, &pool, &config, prior, minimize)
    }

    /// Instance partitions for a tier, always a flat pool of the tier's tag
    #[instrument(skip(self, instances, prior), fields(table = %self.table_config.table_name, tier = %tier.name))]
    pub fn assign_tier(
        &self,
        tier: &TierConfig,
        instances: &[InstanceConfig],
        prior: Option<&InstancePartitions>,
        minimize: bool,
    ) -> Result<InstancePartitions> {
        let name = tier.instance_partitions_name(&self.table_config.table_name);
        let pool = tag_pool(instances, &tier.server_tag)?;
        compute_instance_partitions(
            &name,
            &pool,
            &ReplicaGroupPartitionConfig::default(),
            prior,
            minimize,
        )
    }

    /// Apply the partition selector to a replica group config
    fn resolve(&self, assignment: &InstanceAssignmentConfig) -> Result<ReplicaGroupPartitionConfig> {
        let mut config = assignment.replica_group_partition.clone();
        if assignment.partition_selector == PartitionSelector::ImplicitRealtimeTable {
            let partitions = self.table_config.stream_partitions.ok_or_else(|| {
                TesseraError::InvalidConfig(format!(
                    "implicit realtime partition selector requires stream partitions for {}",
                    self.table_config.table_name
                ))
            })?;
            config.num_partitions = partitions.max(1);
            config.num_instances_per_partition = 1;
        }
        Ok(config)
    }
}

/// Compute instance partitions for a sorted pool
pub fn compute_instance_partitions(
    name: &str,
    pool: &[String],
    config: &ReplicaGroupPartitionConfig,
    prior: Option<&InstancePartitions>,
    minimize: bool,
) -> Result<InstancePartitions> {
    if pool.is_empty() {
        return Err(TesseraError::EmptyInstancePool {
            tag: name.to_string(),
        });
    }
    let prior = prior.filter(|_| minimize);

    if !config.replica_group_based {
        return flat_instance_partitions(name, pool, prior);
    }

    if config.num_replica_groups == 0 || config.num_partitions == 0 {
        return Err(TesseraError::InvalidConfig(format!(
            "{}: numReplicaGroups and numPartitions must be positive",
            name
        )));
    }

    let groups = replica_group_members(name, pool, config, prior)?;
    let group_size = groups[0].len();
    let per_partition = match config.num_instances_per_partition {
        0 => group_size,
        k if k > group_size => {
            return Err(TesseraError::InsufficientInstances {
                context: format!("{} partition", name),
                available: group_size,
                required: k,
            });
        }
        k => k,
    };

    let mut instance_partitions =
        InstancePartitions::new(name, config.num_partitions, config.num_replica_groups)?;
    for (replica_group, members) in groups.iter().enumerate() {
        let slots = match prior {
            Some(prior) => {
                minimized_partition_slots(prior, replica_group, members, config.num_partitions, per_partition)
            }
            None => (0..config.num_partitions)
                .map(|p| {
                    (0..per_partition)
                        .map(|j| members[(p * per_partition + j) % members.len()].clone())
                        .collect()
                })
                .collect(),
        };
        for (partition, instances) in slots.into_iter().enumerate() {
            instance_partitions.set_instances(partition, replica_group, instances)?;
        }
    }

    info!(
        name = name,
        replica_groups = config.num_replica_groups,
        instances_per_group = group_size,
        partitions = config.num_partitions,
        minimized = prior.is_some(),
        "Computed instance partitions"
    );
    Ok(instance_partitions)
}

fn flat_instance_partitions(
    name: &str,
    pool: &[String],
    prior: Option<&InstancePartitions>,
) -> Result<InstancePartitions> {
    let instances = match prior.and_then(|p| p.instances(0, 0)) {
        Some(existing) => {
            let pooled: BTreeSet<&String> = pool.iter().collect();
            let mut kept: Vec<String> = existing
                .iter()
                .filter(|i| pooled.contains(i))
                .cloned()
                .collect();
            let known: BTreeSet<String> = kept.iter().cloned().collect();
            kept.extend(pool.iter().filter(|i| !known.contains(*i)).cloned());
            kept
        }
        None => pool.to_vec(),
    };
    debug!(name = name, instances = instances.len(), "Flat instance partitions");
    InstancePartitions::single(name, instances)
}

/// Members of each replica group, all groups the same size
fn replica_group_members(
    name: &str,
    pool: &[String],
    config: &ReplicaGroupPartitionConfig,
    prior: Option<&InstancePartitions>,
) -> Result<Vec<Vec<String>>> {
    let num_groups = config.num_replica_groups;
    let group_size = match config.num_instances_per_replica_group {
        0 if pool.len() >= num_groups => pool.len() / num_groups,
        0 if config.allow_instance_reuse => 1,
        0 => {
            return Err(TesseraError::InsufficientInstances {
                context: format!("{} replica groups", name),
                available: pool.len(),
                required: num_groups,
            });
        }
        n => n,
    };

    let required = group_size * num_groups;
    if required > pool.len() {
        if !config.allow_instance_reuse || group_size > pool.len() {
            return Err(TesseraError::InsufficientInstances {
                context: format!("{} replica groups", name),
                available: pool.len(),
                required,
            });
        }
        // Windows over the sorted pool; a server may sit in several groups
        return Ok((0..num_groups)
            .map(|rg| {
                (0..group_size)
                    .map(|j| pool[(rg * group_size + j) % pool.len()].clone())
                    .collect()
            })
            .collect());
    }

    let mut groups: Vec<Vec<String>> = vec![Vec::with_capacity(group_size); num_groups];
    let mut used: BTreeSet<String> = BTreeSet::new();

    if let Some(prior) = prior {
        let pooled: BTreeSet<&str> = pool.iter().map(String::as_str).collect();
        for (rg, group) in groups.iter_mut().enumerate() {
            if rg >= prior.num_replica_groups() {
                break;
            }
            for member in prior.replica_group_members(rg) {
                if group.len() < group_size && pooled.contains(member.as_str()) && !used.contains(&member) {
                    used.insert(member.clone());
                    group.push(member);
                }
            }
        }
        for instance in pool.iter().filter(|i| !used.contains(*i)) {
            let target = groups
                .iter()
                .enumerate()
                .filter(|(_, g)| g.len() < group_size)
                .min_by_key(|(rg, g)| (g.len(), *rg))
                .map(|(rg, _)| rg);
            match target {
                Some(rg) => groups[rg].push(instance.clone()),
                None => break,
            }
        }
        for group in groups.iter_mut() {
            group.sort();
        }
    } else {
        for (i, instance) in pool.iter().take(required).enumerate() {
            groups[i % num_groups].push(instance.clone());
        }
    }

    Ok(groups)
}

/// Keep prior partition slots under the per-member cap, refill the rest.
/// `members` is sorted, so the lowest index is also the lowest id.
fn minimized_partition_slots(
    prior: &InstancePartitions,
    replica_group: usize,
    members: &[String],
    num_partitions: usize,
    per_partition: usize,
) -> Vec<Vec<String>> {
    let cap = (num_partitions * per_partition).div_ceil(members.len());
    let mut load = vec![0usize; members.len()];
    let mut slots: Vec<Vec<usize>> = Vec::with_capacity(num_partitions);

    for partition in 0..num_partitions {
        let mut kept: Vec<usize> = Vec::with_capacity(per_partition);
        let existing: &[String] =
            if replica_group < prior.num_replica_groups() && partition < prior.num_partitions() {
                prior.instances(partition, replica_group).unwrap_or(&[])
            } else {
                &[]
            };
        for instance in existing {
            if kept.len() >= per_partition {
                break;
            }
            if let Some(idx) = members.iter().position(|m| m == instance) {
                if !kept.contains(&idx) && load[idx] < cap {
                    load[idx] += 1;
                    kept.push(idx);
                }
            }
        }
        slots.push(kept);
    }

    for slot in slots.iter_mut() {
        while slot.len() < per_partition {
            let next = (0..members.len())
                .filter(|idx| !slot.contains(idx))
                .min_by_key(|idx| (load[*idx], *idx));
            match next {
                Some(idx) => {
                    load[idx] += 1;
                    slot.push(idx);
                }
                None => break,
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.into_iter().map(|idx| members[idx].clone()).collect())
        .collect()
}
