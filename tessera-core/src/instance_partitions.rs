//! Instance partitions
//!
//! Maps (partition, replica group) to an ordered list of server ids. Index 0 of
//! each list is the primary server for that slot. Keys serialize as
//! `"<partition>_<replicaGroup>"`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, TesseraError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancePartitions {
    name: String,
    num_partitions: usize,
    num_replica_groups: usize,
    partition_to_instances: BTreeMap<String, Vec<String>>,
}

impl InstancePartitions {
    pub fn new(name: impl Into<String>, num_partitions: usize, num_replica_groups: usize) -> Result<Self> {
        if num_partitions == 0 || num_replica_groups == 0 {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "numPartitions ({}) and numReplicaGroups ({}) must be positive",
                num_partitions, num_replica_groups
            )));
        }
        Ok(Self {
            name: name.into(),
            num_partitions,
            num_replica_groups,
            partition_to_instances: BTreeMap::new(),
        })
    }

    /// Single partition, single replica group holding all instances
    pub fn single(name: impl Into<String>, instances: Vec<String>) -> Result<Self> {
        let mut partitions = Self::new(name, 1, 1)?;
        partitions.set_instances(0, 0, instances)?;
        Ok(partitions)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn num_replica_groups(&self) -> usize {
        self.num_replica_groups
    }

    /// Whether this maps a single partition onto a single group
    pub fn is_flat(&self) -> bool {
        self.num_partitions == 1 && self.num_replica_groups == 1
    }

    fn key(partition: usize, replica_group: usize) -> String {
        format!("{}_{}", partition, replica_group)
    }

    /// Set the server list for one slot
    pub fn set_instances(
        &mut self,
        partition: usize,
        replica_group: usize,
        instances: Vec<String>,
    ) -> Result<()> {
        if partition >= self.num_partitions || replica_group >= self.num_replica_groups {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "slot ({}, {}) out of range [0, {}) x [0, {})",
                partition, replica_group, self.num_partitions, self.num_replica_groups
            )));
        }
        if instances.is_empty() {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "empty instance list for slot ({}, {})",
                partition, replica_group
            )));
        }
        let unique: BTreeSet<&String> = instances.iter().collect();
        if unique.len() != instances.len() {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "duplicate instance in slot ({}, {})",
                partition, replica_group
            )));
        }
        self.partition_to_instances
            .insert(Self::key(partition, replica_group), instances);
        Ok(())
    }

    pub fn instances(&self, partition: usize, replica_group: usize) -> Option<&[String]> {
        self.partition_to_instances
            .get(&Self::key(partition, replica_group))
            .map(Vec::as_slice)
    }

    /// Every slot in range resolves to a non-empty list
    pub fn is_complete(&self) -> bool {
        (0..self.num_partitions).all(|p| {
            (0..self.num_replica_groups).all(|rg| self.instances(p, rg).is_some_and(|l| !l.is_empty()))
        })
    }

    /// Check the invariants for a value that bypassed `set_instances` (e.g. deserialized)
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 || self.num_replica_groups == 0 {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "{} has {} partitions and {} replica groups",
                self.name, self.num_partitions, self.num_replica_groups
            )));
        }
        if !self.is_complete() {
            return Err(TesseraError::InvalidInstancePartitions(format!(
                "{} is incomplete",
                self.name
            )));
        }
        for (key, instances) in &self.partition_to_instances {
            let unique: BTreeSet<&String> = instances.iter().collect();
            if unique.len() != instances.len() {
                return Err(TesseraError::InvalidInstancePartitions(format!(
                    "duplicate instance in slot {} of {}",
                    key, self.name
                )));
            }
        }
        Ok(())
    }

    pub fn all_instances(&self) -> BTreeSet<String> {
        self.partition_to_instances
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Distinct members of one replica group, sorted
    pub fn replica_group_members(&self, replica_group: usize) -> Vec<String> {
        let members: BTreeSet<&String> = (0..self.num_partitions)
            .filter_map(|p| self.instances(p, replica_group))
            .flatten()
            .collect();
        members.into_iter().cloned().collect()
    }

    /// Number of (partition, replica group) slots each server appears in
    pub fn slot_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for instance in self.partition_to_instances.values().flatten() {
            *counts.entry(instance.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_set_and_lookup() {
        let mut ip = InstancePartitions::new("orders_OFFLINE", 2, 2).unwrap();
        ip.set_instances(0, 0, servers(&["s0"])).unwrap();
        ip.set_instances(0, 1, servers(&["s1"])).unwrap();
        ip.set_instances(1, 0, servers(&["s2"])).unwrap();
        assert!(!ip.is_complete());

        ip.set_instances(1, 1, servers(&["s3", "s0"])).unwrap();
        assert!(ip.is_complete());
        assert_eq!(ip.instances(1, 1).unwrap(), &["s3".to_string(), "s0".to_string()]);
        assert_eq!(ip.all_instances().len(), 4);
        assert_eq!(ip.slot_counts()["s0"], 2);
        assert_eq!(ip.replica_group_members(1), servers(&["s0", "s1", "s3"]));
    }

    #[test]
    fn test_rejects_invalid_slots() {
        let mut ip = InstancePartitions::new("t", 1, 1).unwrap();
        assert!(ip.set_instances(1, 0, servers(&["s0"])).is_err());
        assert!(ip.set_instances(0, 0, vec![]).is_err());
        assert!(ip.set_instances(0, 0, servers(&["s0", "s0"])).is_err());
        assert!(InstancePartitions::new("t", 0, 1).is_err());
    }

    #[test]
    fn test_serialized_keys() {
        let ip = InstancePartitions::single("t_OFFLINE", servers(&["a", "b"])).unwrap();
        let json = serde_json::to_value(&ip).unwrap();
        assert_eq!(json["partitionToInstances"]["0_0"][1], "b");

        let back: InstancePartitions = serde_json::from_value(json).unwrap();
        assert_eq!(back, ip);
        back.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_deserialized_zero_sizes() {
        let zero_partitions: InstancePartitions = serde_json::from_value(serde_json::json!({
            "name": "t_OFFLINE",
            "numPartitions": 0,
            "numReplicaGroups": 2,
            "partitionToInstances": {}
        }))
        .unwrap();
        assert!(zero_partitions.is_complete());
        assert!(matches!(
            zero_partitions.validate(),
            Err(TesseraError::InvalidInstancePartitions(_))
        ));

        let zero_groups: InstancePartitions = serde_json::from_value(serde_json::json!({
            "name": "t_OFFLINE",
            "numPartitions": 1,
            "numReplicaGroups": 0,
            "partitionToInstances": {}
        }))
        .unwrap();
        assert!(zero_groups.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_partial_slots() {
        let partial: InstancePartitions = serde_json::from_value(serde_json::json!({
            "name": "t_OFFLINE",
            "numPartitions": 2,
            "numReplicaGroups": 1,
            "partitionToInstances": { "0_0": ["s0"] }
        }))
        .unwrap();
        assert!(partial.validate().is_err());

        let duplicated: InstancePartitions = serde_json::from_value(serde_json::json!({
            "name": "t_OFFLINE",
            "numPartitions": 1,
            "numReplicaGroups": 1,
            "partitionToInstances": { "0_0": ["s0", "s0"] }
        }))
        .unwrap();
        assert!(duplicated.validate().is_err());
    }
}
