//! In-memory cluster
//!
//! A process-local implementation of every collaborator trait, backed by a
//! serializable snapshot. Used by the CLI (snapshot loaded from and saved to a
//! JSON file) and by tests. Optionally converges the external view to each
//! ideal state write, as live servers would.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

use tessera_assignment::{InstanceAssignmentDriver, InstancePartitionsMap, SegmentAssignmentStrategy};
use tessera_core::{
    DiskUsageInfo, ExternalView, IdealState, InstanceConfig, InstancePartitions, Result,
    SegmentAssignment, SegmentMetadata, SegmentState, TableConfig, TesseraError,
};

use crate::cluster::{
    ClusterResult, ClusterStateStore, DiskUsageSource, ReloadStatusProbe, SegmentMetadataStore,
    StreamOffsetSource,
};

/// Everything known about one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub config: TableConfig,
    pub ideal_state: IdealState,
    #[serde(default)]
    pub external_view: ExternalView,
    #[serde(default)]
    pub segments: BTreeMap<String, SegmentMetadata>,
    /// Latest stream offset per partition (realtime tables)
    #[serde(default)]
    pub stream_offsets: BTreeMap<u32, i64>,
}

/// Serializable cluster state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSnapshot {
    pub instances: Vec<InstanceConfig>,
    pub tables: BTreeMap<String, TableSnapshot>,
    pub instance_partitions: BTreeMap<String, InstancePartitions>,
    pub disk_usage: BTreeMap<String, DiskUsageInfo>,
    /// Servers reporting that a reload is needed
    pub needs_reload: BTreeSet<String>,
}

/// Cluster state held in process memory
pub struct InMemoryCluster {
    state: RwLock<ClusterSnapshot>,
    auto_converge: bool,
    /// Conflicts to report before accepting the next writes
    injected_conflicts: AtomicU32,
    ideal_state_writes: AtomicU64,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::from_snapshot(ClusterSnapshot::default())
    }

    pub fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            auto_converge: true,
            injected_conflicts: AtomicU32::new(0),
            ideal_state_writes: AtomicU64::new(0),
        }
    }

    /// Whether the external view follows ideal state writes immediately
    pub fn with_auto_converge(mut self, auto_converge: bool) -> Self {
        self.auto_converge = auto_converge;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_snapshot(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.state.read())?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.state.read().clone()
    }

    pub fn add_instance(&self, instance: InstanceConfig) {
        let mut state = self.state.write();
        state.instances.retain(|i| i.id != instance.id);
        state.instances.push(instance);
    }

    pub fn set_instance_enabled(&self, id: &str, enabled: bool) {
        if let Some(instance) = self.state.write().instances.iter_mut().find(|i| i.id == id) {
            instance.enabled = enabled;
        }
    }

    /// Register a table with an empty ideal state. Instance partitions are
    /// persisted for types carrying an explicit instance assignment config.
    pub fn add_table(&self, config: TableConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.write();
        let driver = InstanceAssignmentDriver::new(&config);
        for ty in config.instance_partitions_types() {
            if config.instance_assignment_config(ty).is_some() {
                let partitions = driver.assign(ty, &state.instances, None, None)?;
                state
                    .instance_partitions
                    .insert(partitions.name().to_string(), partitions);
            }
        }
        let table = config.table_name.clone();
        state.tables.insert(
            table.clone(),
            TableSnapshot {
                ideal_state: IdealState::new(&table),
                config,
                external_view: ExternalView::new(),
                segments: BTreeMap::new(),
                stream_offsets: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Replace a table's config, leaving its assignment untouched
    pub fn update_table_config(&self, config: TableConfig) -> Result<()> {
        let mut state = self.state.write();
        let table = state
            .tables
            .get_mut(&config.table_name)
            .ok_or_else(|| TesseraError::TableNotFound(config.table_name.clone()))?;
        table.config = config;
        Ok(())
    }

    /// Upload a segment, placing it on the least loaded servers
    pub fn add_segment(&self, table: &str, segment: SegmentMetadata) -> Result<()> {
        let mut state = self.state.write();
        let snapshot = state
            .tables
            .get(table)
            .ok_or_else(|| TesseraError::TableNotFound(table.to_string()))?;
        let config = snapshot.config.clone();

        let driver = InstanceAssignmentDriver::new(&config);
        let mut partitions = InstancePartitionsMap::new();
        for ty in config.instance_partitions_types() {
            let name = ty.instance_partitions_name(&config.table_name);
            let ip = match state.instance_partitions.get(&name) {
                Some(ip) => ip.clone(),
                None => driver.assign(ty, &state.instances, None, None)?,
            };
            partitions.insert(ty, ip);
        }

        let strategy = SegmentAssignmentStrategy::for_table(&config);
        let instance_state_map =
            strategy.assign_segment(&segment, &snapshot.ideal_state.assignment, &partitions)?;

        let auto_converge = self.auto_converge;
        let snapshot = state
            .tables
            .get_mut(table)
            .ok_or_else(|| TesseraError::TableNotFound(table.to_string()))?;
        snapshot
            .ideal_state
            .assignment
            .insert(segment.name.clone(), instance_state_map.clone());
        snapshot.ideal_state.version += 1;
        if auto_converge {
            snapshot
                .external_view
                .insert(segment.name.clone(), instance_state_map);
        }
        snapshot.segments.insert(segment.name.clone(), segment);
        Ok(())
    }

    pub fn table_config(&self, table: &str) -> Option<TableConfig> {
        self.state.read().tables.get(table).map(|t| t.config.clone())
    }

    pub fn ideal_state(&self, table: &str) -> Option<IdealState> {
        self.state.read().tables.get(table).map(|t| t.ideal_state.clone())
    }

    pub fn external_view(&self, table: &str) -> Option<ExternalView> {
        self.state.read().tables.get(table).map(|t| t.external_view.clone())
    }

    pub fn set_external_view(&self, table: &str, external_view: ExternalView) {
        if let Some(snapshot) = self.state.write().tables.get_mut(table) {
            snapshot.external_view = external_view;
        }
    }

    pub fn segment_metadata(&self, table: &str, segment: &str) -> Option<SegmentMetadata> {
        self.state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.segments.get(segment).cloned())
    }

    pub fn instance_partitions(&self, name: &str) -> Option<InstancePartitions> {
        self.state.read().instance_partitions.get(name).cloned()
    }

    pub fn set_disk_usage(&self, instance: &str, info: DiskUsageInfo) {
        self.state.write().disk_usage.insert(instance.to_string(), info);
    }

    pub fn set_stream_offset(&self, table: &str, partition: u32, offset: i64) {
        if let Some(snapshot) = self.state.write().tables.get_mut(table) {
            snapshot.stream_offsets.insert(partition, offset);
        }
    }

    pub fn set_needs_reload(&self, instance: &str) {
        self.state.write().needs_reload.insert(instance.to_string());
    }

    /// Make the next `count` compare-and-set calls lose to a concurrent writer
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Successful ideal state writes through the compare-and-set path
    pub fn ideal_state_writes(&self) -> u64 {
        self.ideal_state_writes.load(Ordering::SeqCst)
    }

    fn converged_view(assignment: &SegmentAssignment) -> ExternalView {
        assignment
            .iter()
            .map(|(segment, instances)| {
                let live = instances
                    .iter()
                    .filter(|(_, state)| **state != SegmentState::Offline)
                    .map(|(instance, state)| (instance.clone(), *state))
                    .collect();
                (segment.clone(), live)
            })
            .collect()
    }
}

// =============================================================================
// COLLABORATOR IMPLEMENTATIONS
// =============================================================================

#[async_trait::async_trait]
impl ClusterStateStore for InMemoryCluster {
    async fn get_ideal_state(&self, table: &str) -> ClusterResult<Option<IdealState>> {
        Ok(self.ideal_state(table))
    }

    async fn compare_and_set_ideal_state(
        &self,
        table: &str,
        expected_version: u64,
        assignment: SegmentAssignment,
    ) -> ClusterResult<bool> {
        let mut state = self.state.write();
        let snapshot = state
            .tables
            .get_mut(table)
            .ok_or_else(|| format!("table {} does not exist", table))?;

        let pending = self.injected_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.injected_conflicts.store(pending - 1, Ordering::SeqCst);
            snapshot.ideal_state.version += 1;
            debug!(table = %table, "Injected ideal state conflict");
            return Ok(false);
        }
        if snapshot.ideal_state.version != expected_version {
            return Ok(false);
        }

        if self.auto_converge {
            snapshot.external_view = Self::converged_view(&assignment);
        }
        snapshot.ideal_state.assignment = assignment;
        snapshot.ideal_state.version += 1;
        self.ideal_state_writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn get_external_view(&self, table: &str) -> ClusterResult<Option<ExternalView>> {
        Ok(self.external_view(table))
    }

    async fn get_instance_configs(&self) -> ClusterResult<Vec<InstanceConfig>> {
        Ok(self.state.read().instances.clone())
    }

    async fn get_instance_partitions(&self, name: &str) -> ClusterResult<Option<InstancePartitions>> {
        Ok(self.instance_partitions(name))
    }

    async fn put_instance_partitions(&self, partitions: &InstancePartitions) -> ClusterResult<()> {
        self.state
            .write()
            .instance_partitions
            .insert(partitions.name().to_string(), partitions.clone());
        Ok(())
    }

    async fn remove_instance_partitions(&self, name: &str) -> ClusterResult<()> {
        self.state.write().instance_partitions.remove(name);
        Ok(())
    }
}

#[async_trait::async_trait]
impl SegmentMetadataStore for InMemoryCluster {
    async fn get_segment_metadata(&self, table: &str) -> ClusterResult<Vec<SegmentMetadata>> {
        Ok(self
            .state
            .read()
            .tables
            .get(table)
            .map(|t| t.segments.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_target_tiers(
        &self,
        table: &str,
        tiers: &BTreeMap<String, Option<String>>,
    ) -> ClusterResult<()> {
        let mut state = self.state.write();
        let snapshot = state
            .tables
            .get_mut(table)
            .ok_or_else(|| format!("table {} does not exist", table))?;
        for (segment, tier) in tiers {
            if let Some(metadata) = snapshot.segments.get_mut(segment) {
                metadata.target_tier = tier.clone();
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl DiskUsageSource for InMemoryCluster {
    async fn disk_usage(&self, instance: &str) -> ClusterResult<Option<DiskUsageInfo>> {
        Ok(self.state.read().disk_usage.get(instance).copied())
    }
}

#[async_trait::async_trait]
impl ReloadStatusProbe for InMemoryCluster {
    async fn needs_reload(&self, instance: &str, _table: &str) -> ClusterResult<bool> {
        Ok(self.state.read().needs_reload.contains(instance))
    }
}

#[async_trait::async_trait]
impl StreamOffsetSource for InMemoryCluster {
    async fn latest_offset(&self, table: &str, partition: u32) -> ClusterResult<Option<i64>> {
        Ok(self
            .state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.stream_offsets.get(&partition).copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cluster(servers: usize) -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        for i in 0..servers {
            cluster.add_instance(InstanceConfig::new(format!("server_{}", i), &["DefaultTenant_OFFLINE"]));
        }
        cluster
    }

    #[test]
    fn test_add_segments_balanced() {
        let cluster = make_cluster(3);
        cluster
            .add_table(TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE"))
            .unwrap();
        for i in 0..3 {
            cluster
                .add_segment("orders_OFFLINE", SegmentMetadata::new(format!("seg_{}", i)))
                .unwrap();
        }

        let ideal = cluster.ideal_state("orders_OFFLINE").unwrap();
        assert_eq!(ideal.version, 3);
        assert!(ideal.assignment.values().all(|m| m.len() == 2));
        let load = tessera_core::instance_to_segments(&ideal.assignment);
        assert!(load.values().all(|segments| segments.len() == 2));
        assert_eq!(cluster.external_view("orders_OFFLINE").unwrap(), ideal.assignment);
    }

    #[test]
    fn test_missing_table() {
        let cluster = make_cluster(1);
        assert!(matches!(
            cluster.add_segment("nope_OFFLINE", SegmentMetadata::new("seg_0")),
            Err(TesseraError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let cluster = make_cluster(1);
        cluster
            .add_table(TableConfig::offline("orders", 1, "DefaultTenant_OFFLINE"))
            .unwrap();

        let mut assignment = SegmentAssignment::new();
        assignment.insert(
            "seg_0".to_string(),
            tessera_core::instance_state_map(["server_0"], SegmentState::Online),
        );
        assert!(!cluster
            .compare_and_set_ideal_state("orders_OFFLINE", 7, assignment.clone())
            .await
            .unwrap());
        assert!(cluster
            .compare_and_set_ideal_state("orders_OFFLINE", 0, assignment.clone())
            .await
            .unwrap());
        assert_eq!(cluster.ideal_state("orders_OFFLINE").unwrap().version, 1);
        assert_eq!(cluster.ideal_state_writes(), 1);

        cluster.inject_conflicts(1);
        assert!(!cluster
            .compare_and_set_ideal_state("orders_OFFLINE", 1, assignment)
            .await
            .unwrap());
        assert_eq!(cluster.ideal_state("orders_OFFLINE").unwrap().version, 2);
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let cluster = make_cluster(2);
        cluster
            .add_table(TableConfig::offline("orders", 1, "DefaultTenant_OFFLINE"))
            .unwrap();
        cluster
            .add_segment("orders_OFFLINE", SegmentMetadata::new("seg_0").with_size(10))
            .unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        cluster.save(file.path()).unwrap();
        let loaded = InMemoryCluster::load(file.path()).unwrap();
        assert_eq!(loaded.snapshot(), cluster.snapshot());
    }
}
