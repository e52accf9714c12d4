//! Routing table
//!
//! Holds the latest candidate snapshot of one table behind an `ArcSwap`.
//! Queries load the snapshot without locking; a refresh builds a new snapshot
//! and swaps it in whole, so in-flight queries keep reading the old one.

use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use tessera_core::{ExternalView, IdealState, InstanceConfig, TableConfig};

use crate::candidate::{build_segment_states, CandidateContext, SegmentStates};
use crate::metrics;
use crate::selector::{QueryOptions, ReplicaGroupInstanceSelector, Selection};

/// How long a pushed segment may be routed to servers that have not loaded it
pub const DEFAULT_NEW_SEGMENT_EXPIRATION: Duration = Duration::from_secs(300);

pub struct RoutingTable {
    selector: ReplicaGroupInstanceSelector,
    new_segment_expiration: Duration,
    states: ArcSwap<SegmentStates>,
}

impl RoutingTable {
    pub fn new(selector: ReplicaGroupInstanceSelector, new_segment_expiration: Duration) -> Self {
        Self {
            selector,
            new_segment_expiration,
            states: ArcSwap::from_pointee(SegmentStates::default()),
        }
    }

    pub fn for_table(config: &TableConfig) -> Self {
        Self::new(
            ReplicaGroupInstanceSelector::for_table(config),
            DEFAULT_NEW_SEGMENT_EXPIRATION,
        )
    }

    pub fn table_name(&self) -> &str {
        self.selector.table_name()
    }

    /// Rebuild candidates from the latest ideal state and external view
    pub fn refresh(
        &self,
        ideal_state: &IdealState,
        external_view: &ExternalView,
        instances: &[InstanceConfig],
        segment_creation_ms: &BTreeMap<String, i64>,
    ) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.refresh_at(ideal_state, external_view, instances, segment_creation_ms, now_ms);
    }

    /// Refresh with an explicit wall clock
    #[instrument(skip_all, fields(table = %self.table_name(), version = ideal_state.version))]
    pub fn refresh_at(
        &self,
        ideal_state: &IdealState,
        external_view: &ExternalView,
        instances: &[InstanceConfig],
        segment_creation_ms: &BTreeMap<String, i64>,
        now_ms: i64,
    ) {
        let ctx = CandidateContext {
            instances,
            segment_creation_ms,
            now_ms,
            new_segment_expiration: self.new_segment_expiration,
        };
        let states = build_segment_states(ideal_state, external_view, &ctx);
        let unavailable = states.unavailable_segments().len();
        metrics::record_refresh(self.table_name(), unavailable);
        if unavailable > 0 {
            info!(unavailable, "Segments without routable servers");
        }
        self.states.store(Arc::new(states));
    }

    /// Current candidate snapshot
    pub fn snapshot(&self) -> Arc<SegmentStates> {
        self.states.load_full()
    }

    /// Servers for the segments of one query
    pub fn route(&self, segments: &[String], request_id: u64, options: &QueryOptions) -> Selection {
        let states = self.states.load();
        self.selector.select(segments, request_id, &states, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{instance_state_map, SegmentState};

    fn make_instances(n: usize) -> Vec<InstanceConfig> {
        (0..n)
            .map(|i| InstanceConfig::new(format!("server_{}", i), &["DefaultTenant_OFFLINE"]))
            .collect()
    }

    fn make_ideal_state(version: u64, servers: &[&str]) -> IdealState {
        let mut ideal_state = IdealState::new("orders_OFFLINE");
        ideal_state.version = version;
        for i in 0..4 {
            ideal_state.assignment.insert(
                format!("seg_{}", i),
                instance_state_map(servers.iter().copied(), SegmentState::Online),
            );
        }
        ideal_state
    }

    fn segments() -> Vec<String> {
        (0..4).map(|i| format!("seg_{}", i)).collect()
    }

    #[test]
    fn test_route_before_refresh_is_unavailable() {
        let table = RoutingTable::for_table(&TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE"));
        let selection = table.route(&segments(), 0, &QueryOptions::new());
        assert!(selection.segments.is_empty());
        assert_eq!(selection.unavailable_segments.len(), 4);
    }

    #[test]
    fn test_refresh_and_route() {
        let table = RoutingTable::for_table(&TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE"));
        let ideal = make_ideal_state(1, &["server_0", "server_1"]);
        table.refresh(&ideal, &ideal.assignment, &make_instances(2), &BTreeMap::new());

        let selection = table.route(&segments(), 1, &QueryOptions::new());
        assert_eq!(selection.segments.len(), 4);
        assert!(selection.segments.values().all(|s| s == "server_1"));
        assert_eq!(table.snapshot().version(), 1);
    }

    #[test]
    fn test_old_snapshot_survives_refresh() {
        let table = RoutingTable::for_table(&TableConfig::offline("orders", 2, "DefaultTenant_OFFLINE"));
        let ideal = make_ideal_state(1, &["server_0", "server_1"]);
        table.refresh_at(&ideal, &ideal.assignment, &make_instances(4), &BTreeMap::new(), 0);
        let held = table.snapshot();

        let moved = make_ideal_state(2, &["server_2", "server_3"]);
        table.refresh_at(&moved, &moved.assignment, &make_instances(4), &BTreeMap::new(), 0);

        assert_eq!(held.version(), 1);
        assert_eq!(held.candidates("seg_0").unwrap()[0].instance, "server_0");
        let selection = table.route(&segments(), 0, &QueryOptions::new());
        assert!(selection.segments.values().all(|s| s == "server_2"));
    }

    #[test]
    fn test_new_segment_routed_as_optional() {
        let table = RoutingTable::for_table(&TableConfig::offline("orders", 1, "DefaultTenant_OFFLINE"));
        let ideal = make_ideal_state(3, &["server_0"]);
        let mut view = ideal.assignment.clone();
        view.remove("seg_3");
        let created: BTreeMap<String, i64> = [("seg_3".to_string(), 1_000)].into_iter().collect();

        table.refresh_at(&ideal, &view, &make_instances(1), &created, 61_000);
        let selection = table.route(&segments(), 0, &QueryOptions::new());
        assert_eq!(selection.segments.len(), 3);
        assert_eq!(selection.optional_segments["seg_3"], "server_0");
    }
}
