//! Tessera Broker
//!
//! Query-time server selection for replica-group tables:
//! - Candidate lists built from ideal state and external view
//! - Replica-group instance selector (round-robin, fixed replica, adaptive)
//! - Lock-free routing snapshot per table

pub mod candidate;
pub mod metrics;
pub mod routing;
pub mod selector;

pub use candidate::{build_segment_states, CandidateContext, SegmentInstanceCandidate, SegmentStates};
pub use routing::{RoutingTable, DEFAULT_NEW_SEGMENT_EXPIRATION};
pub use selector::{
    fixed_replica_hash, num_replica_groups_to_query, options, QueryOptions,
    ReplicaGroupInstanceSelector, Selection, ServerRanker,
};
