//! Broker routing metrics

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::collections::BTreeMap;

/// Metric names as constants
pub mod names {
    pub const POOL_SEGMENTS_QUERIED: &str = "tessera_broker_pool_segments_queried_total";
    pub const ROUTING_REFRESHES: &str = "tessera_broker_routing_refreshes_total";
    pub const UNAVAILABLE_SEGMENTS: &str = "tessera_broker_unavailable_segments";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(
        names::POOL_SEGMENTS_QUERIED,
        "Segments routed to servers of each pool"
    );
    describe_counter!(
        names::ROUTING_REFRESHES,
        "Routing snapshot rebuilds"
    );
    describe_gauge!(
        names::UNAVAILABLE_SEGMENTS,
        "Segments without any routable server"
    );
}

pub fn record_pool_segments(pool_counts: &BTreeMap<u32, u64>) {
    for (pool, count) in pool_counts {
        counter!(names::POOL_SEGMENTS_QUERIED, "pool" => pool.to_string()).increment(*count);
    }
}

pub fn record_refresh(table: &str, unavailable: usize) {
    counter!(names::ROUTING_REFRESHES, "table" => table.to_string()).increment(1);
    gauge!(names::UNAVAILABLE_SEGMENTS, "table" => table.to_string()).set(unavailable as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        init_metrics();
        record_pool_segments(&[(0, 3), (1, 2)].into_iter().collect());
        record_refresh("orders_OFFLINE", 1);
    }
}
