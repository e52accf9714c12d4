//! Tessera Rebalancer Library
//!
//! Moves a table from its current segment assignment to the one implied by
//! its config and the live set of servers.
//!
//! A rebalance:
//! - Recomputes instance partitions (optionally minimizing data movement)
//! - Computes the target segment assignment and a summary of the move
//! - Runs advisory pre-checks in dry-run mode
//! - Writes the target in steps that keep a minimum number of replicas
//!   available, waiting for the external view between steps

pub mod batch;
pub mod cluster;
pub mod config;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod precheck;
pub mod rebalancer;
pub mod summary;
pub mod updater;

// Re-export main types
pub use batch::{next_assignment, reached_target};
pub use cluster::{
    ClusterError, ClusterResult, ClusterStateStore, DiskUsageSource, ReloadStatusProbe,
    SegmentMetadataStore, StreamOffsetSource,
};
pub use config::{ConfigError, RebalancerConfig};
pub use job::{
    Enablement, ProgressStatus, RebalanceConfig, RebalanceProgress, RebalanceResult,
    RebalanceStatus, DISABLE_BATCH_SIZE_PER_SERVER,
};
pub use memory::{ClusterSnapshot, InMemoryCluster, TableSnapshot};
pub use precheck::{
    PreCheckConfig, PreCheckContext, PreCheckResult, PreCheckStatus, RebalancePreChecker,
};
pub use rebalancer::{external_view_converged, Convergence, TableRebalancer};
pub use summary::{compute_summary, RebalanceSummaryResult};
pub use updater::{update_ideal_state, IdealStateUpdate};
