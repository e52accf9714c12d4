//! Cluster collaborators
//!
//! Everything the rebalancer reads from or writes to lives behind these
//! traits, injected at construction:
//! - Cluster state store (ideal state, external view, instances, instance partitions)
//! - Segment metadata store
//! - Disk usage, reload status and stream offset sources used by pre-checks
//!   and the dry-run summary

use std::collections::BTreeMap;

use tessera_core::{
    DiskUsageInfo, ExternalView, IdealState, InstanceConfig, InstancePartitions,
    SegmentAssignment, SegmentMetadata,
};

/// Error type returned by collaborators
pub type ClusterError = Box<dyn std::error::Error + Send + Sync>;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

// =============================================================================
// TRAITS FOR DEPENDENCY INJECTION
// =============================================================================

/// Cluster coordination state
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ClusterStateStore: Send + Sync {
    async fn get_ideal_state(&self, table: &str) -> ClusterResult<Option<IdealState>>;

    /// Replace the assignment if the stored version still equals
    /// `expected_version`. Returns false on a version conflict. A successful
    /// write bumps the version by one.
    async fn compare_and_set_ideal_state(
        &self,
        table: &str,
        expected_version: u64,
        assignment: SegmentAssignment,
    ) -> ClusterResult<bool>;

    async fn get_external_view(&self, table: &str) -> ClusterResult<Option<ExternalView>>;

    /// All registered servers, enabled or not
    async fn get_instance_configs(&self) -> ClusterResult<Vec<InstanceConfig>>;

    async fn get_instance_partitions(&self, name: &str) -> ClusterResult<Option<InstancePartitions>>;

    async fn put_instance_partitions(&self, partitions: &InstancePartitions) -> ClusterResult<()>;

    async fn remove_instance_partitions(&self, name: &str) -> ClusterResult<()>;
}

/// Per-segment metadata
#[async_trait::async_trait]
pub trait SegmentMetadataStore: Send + Sync {
    async fn get_segment_metadata(&self, table: &str) -> ClusterResult<Vec<SegmentMetadata>>;

    /// Record the tier each segment is placed on (`None` for the default tier)
    async fn set_target_tiers(
        &self,
        table: &str,
        tiers: &BTreeMap<String, Option<String>>,
    ) -> ClusterResult<()>;
}

/// Latest disk usage reported by servers
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DiskUsageSource: Send + Sync {
    async fn disk_usage(&self, instance: &str) -> ClusterResult<Option<DiskUsageInfo>>;
}

/// Asks a server whether its copy of a table needs a reload
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReloadStatusProbe: Send + Sync {
    async fn needs_reload(&self, instance: &str, table: &str) -> ClusterResult<bool>;
}

/// Latest offsets of the stream behind a realtime table
#[async_trait::async_trait]
pub trait StreamOffsetSource: Send + Sync {
    /// `None` when the stream's offsets cannot be compared numerically
    async fn latest_offset(&self, table: &str, partition: u32) -> ClusterResult<Option<i64>>;
}
