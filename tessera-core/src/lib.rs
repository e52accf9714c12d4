//! Tessera Core Library
//!
//! Core abstractions for the Tessera segment placement engine.
//! This crate provides:
//! - Instance partitions: (partition, replica group) to server lists
//! - Segment assignments, ideal state and external view types
//! - Table, tier and instance assignment configuration
//! - Segment and server metadata consumed by the rebalancer
//! - Retry policies for compare-and-set updates
//! - Common error handling

pub mod assignment;
pub mod error;
pub mod instance;
pub mod instance_partitions;
pub mod retry;
pub mod segment;
pub mod table;

pub use assignment::{
    instance_state_map, instance_to_segments, ExternalView, IdealState, InstanceStateMap,
    SegmentAssignment, SegmentState,
};
pub use error::{Result, TesseraError};
pub use instance::{DiskUsageInfo, InstanceConfig};
pub use instance_partitions::InstancePartitions;
pub use retry::RetryPolicy;
pub use segment::{SegmentMetadata, SegmentStatus};
pub use table::{
    raw_table_name, InstanceAssignmentConfig, InstancePartitionsType, PartitionSelector,
    ReplicaGroupPartitionConfig, RoutingConfig, TableConfig, TableType, TierConfig, TierSelector,
};

/// Default pool id for servers without an explicit pool
pub const DEFAULT_POOL: u32 = 0;

/// Separator between a table name and a tier name in tier instance partitions
pub const TIER_SEPARATOR: &str = "__TIER__";
