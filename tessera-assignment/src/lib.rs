//! Tessera Assignment
//!
//! Placement algorithms used by the rebalancer:
//! - Instance assignment: tag pool -> instance partitions
//! - Segment assignment: segments -> servers, per instance partitions and tier
//! - Tier selection for time based and fixed segment tiers
//!
//! Everything here is pure: no cluster I/O, deterministic for equal inputs.

pub mod instance;
pub mod segment;
pub mod tier;

pub use instance::{compute_instance_partitions, tag_pool, InstanceAssignmentDriver};
pub use segment::{
    AssignOptions, SegmentAssignmentStrategy, TargetAssignment, TierPlacement,
    InstancePartitionsMap,
};
pub use tier::{select_tier, sort_tiers, SortedTier};
