//! Rebalance summary
//!
//! What a rebalance will change, computed from the current and target
//! assignments:
//! - Per-server segment adds, deletes and status
//! - Table-wide movement totals and size estimates
//! - Per-tag download counts
//! - For realtime tables, the consuming segments that will move and how far
//!   behind the stream their new replicas start

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

use tessera_core::{
    instance_to_segments, InstanceConfig, SegmentAssignment, SegmentMetadata, SegmentState, TableConfig,
};

use crate::cluster::StreamOffsetSource;

/// Tag reported for servers carrying none of the table's tags
pub const TAG_FOR_OUTDATED_SERVERS: &str = "OUTDATED_SERVERS";

/// Entries kept in the top-N consuming segment lists
const TOP_N: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceChangeInfo {
    pub value_before_rebalance: usize,
    pub expected_value_after_rebalance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Added,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSegmentChangeInfo {
    pub server_status: ServerStatus,
    pub total_segments_after_rebalance: usize,
    pub total_segments_before_rebalance: usize,
    pub segments_added: usize,
    pub segments_deleted: usize,
    pub segments_unchanged: usize,
    pub tag_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub num_servers_getting_new_segments: usize,
    pub num_servers: RebalanceChangeInfo,
    pub servers_added: BTreeSet<String>,
    pub servers_removed: BTreeSet<String>,
    pub servers_unchanged: BTreeSet<String>,
    pub servers_getting_new_segments: BTreeSet<String>,
    pub server_segment_change_info: BTreeMap<String, ServerSegmentChangeInfo>,
}

/// A segment with the value it was ranked by
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedSegment {
    pub segment: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumingServerSummary {
    pub num_consuming_segments_to_be_added: usize,
    /// -1 when any offset could not be fetched
    pub total_offsets_to_catch_up_across_all_consuming_segments: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumingSegmentToBeMovedSummary {
    pub num_consuming_segments_to_be_moved: usize,
    pub num_servers_getting_consuming_segments_added: usize,
    /// Absent when any offset fetch failed or is unsupported
    pub consuming_segments_to_be_moved_with_most_offsets_to_catch_up: Option<Vec<RankedSegment>>,
    pub consuming_segments_to_be_moved_with_oldest_age_in_minutes: Vec<RankedSegment>,
    pub server_consuming_segment_summary: BTreeMap<String, ConsumingServerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInfo {
    pub total_segments_to_be_moved: usize,
    pub total_segments_to_be_deleted: usize,
    pub max_segments_added_to_a_single_server: usize,
    /// -1 when no segment size is known
    pub estimated_average_segment_size_in_bytes: i64,
    pub total_estimated_data_to_be_moved_in_bytes: i64,
    pub replication_factor: RebalanceChangeInfo,
    pub num_segments_in_single_replica: RebalanceChangeInfo,
    pub num_segments_across_all_replicas: RebalanceChangeInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consuming_segment_to_be_moved_summary: Option<ConsumingSegmentToBeMovedSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagInfo {
    pub tag_name: String,
    pub num_segments_to_download: usize,
    pub num_segments_unchanged: usize,
    pub num_server_participants: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceSummaryResult {
    pub server_info: ServerInfo,
    pub segment_info: SegmentInfo,
    pub tags_info: Vec<TagInfo>,
}

impl RebalanceSummaryResult {
    pub fn tag(&self, tag_name: &str) -> Option<&TagInfo> {
        self.tags_info.iter().find(|t| t.tag_name == tag_name)
    }
}

/// Tags a table's segments may be placed on
pub fn table_tags(table_config: &TableConfig) -> BTreeSet<String> {
    let mut tags: BTreeSet<String> = table_config
        .instance_partitions_types()
        .into_iter()
        .map(|ty| table_config.tag_for(ty).to_string())
        .collect();
    tags.extend(table_config.tiers.iter().map(|t| t.server_tag.clone()));
    tags
}

/// Summary of the move from `current` to `target`, without the consuming
/// segment section
pub fn compute_summary(
    table_config: &TableConfig,
    current: &SegmentAssignment,
    target: &SegmentAssignment,
    instances: &[InstanceConfig],
    segments: &BTreeMap<String, SegmentMetadata>,
) -> RebalanceSummaryResult {
    let before = instance_to_segments(current);
    let after = instance_to_segments(target);
    let empty = BTreeSet::new();
    let tags_of = |server: &str| -> Vec<String> {
        instances
            .iter()
            .find(|i| i.id == server)
            .map(|i| i.tags.clone())
            .unwrap_or_default()
    };

    let mut server_info = ServerInfo {
        num_servers_getting_new_segments: 0,
        num_servers: RebalanceChangeInfo {
            value_before_rebalance: before.len(),
            expected_value_after_rebalance: after.len(),
        },
        servers_added: BTreeSet::new(),
        servers_removed: BTreeSet::new(),
        servers_unchanged: BTreeSet::new(),
        servers_getting_new_segments: BTreeSet::new(),
        server_segment_change_info: BTreeMap::new(),
    };

    let servers: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    for server in servers {
        let old = before.get(server).unwrap_or(&empty);
        let new = after.get(server).unwrap_or(&empty);
        let unchanged = old.intersection(new).count();
        let status = match (before.contains_key(server), after.contains_key(server)) {
            (false, true) => ServerStatus::Added,
            (true, false) => ServerStatus::Removed,
            _ => ServerStatus::Unchanged,
        };
        match status {
            ServerStatus::Added => server_info.servers_added.insert(server.clone()),
            ServerStatus::Removed => server_info.servers_removed.insert(server.clone()),
            ServerStatus::Unchanged => server_info.servers_unchanged.insert(server.clone()),
        };
        let info = ServerSegmentChangeInfo {
            server_status: status,
            total_segments_after_rebalance: new.len(),
            total_segments_before_rebalance: old.len(),
            segments_added: new.len() - unchanged,
            segments_deleted: old.len() - unchanged,
            segments_unchanged: unchanged,
            tag_list: tags_of(server),
        };
        if info.segments_added > 0 {
            server_info.servers_getting_new_segments.insert(server.clone());
        }
        server_info
            .server_segment_change_info
            .insert(server.clone(), info);
    }
    server_info.num_servers_getting_new_segments = server_info.servers_getting_new_segments.len();

    let changes = server_info.server_segment_change_info.values();
    let total_moved: usize = changes.clone().map(|c| c.segments_added).sum();
    let total_deleted: usize = changes.clone().map(|c| c.segments_deleted).sum();
    let max_added = changes.map(|c| c.segments_added).max().unwrap_or(0);

    let sizes: Vec<u64> = current
        .keys()
        .filter_map(|segment| segments.get(segment).map(|m| m.size_bytes))
        .collect();
    let average_size = if sizes.is_empty() {
        -1
    } else {
        (sizes.iter().sum::<u64>() / sizes.len() as u64) as i64
    };
    let total_data = if average_size < 0 {
        -1
    } else {
        average_size * total_moved as i64
    };

    let replication = |assignment: &SegmentAssignment| {
        assignment
            .values()
            .map(|m| m.len())
            .max()
            .unwrap_or(table_config.replication)
    };
    let replicas = |assignment: &SegmentAssignment| assignment.values().map(|m| m.len()).sum::<usize>();

    let segment_info = SegmentInfo {
        total_segments_to_be_moved: total_moved,
        total_segments_to_be_deleted: total_deleted,
        max_segments_added_to_a_single_server: max_added,
        estimated_average_segment_size_in_bytes: average_size,
        total_estimated_data_to_be_moved_in_bytes: total_data,
        replication_factor: RebalanceChangeInfo {
            value_before_rebalance: replication(current),
            expected_value_after_rebalance: replication(target),
        },
        num_segments_in_single_replica: RebalanceChangeInfo {
            value_before_rebalance: current.len(),
            expected_value_after_rebalance: target.len(),
        },
        num_segments_across_all_replicas: RebalanceChangeInfo {
            value_before_rebalance: replicas(current),
            expected_value_after_rebalance: replicas(target),
        },
        consuming_segment_to_be_moved_summary: None,
    };

    let tags_info = tags_info(table_config, &server_info);
    RebalanceSummaryResult {
        server_info,
        segment_info,
        tags_info,
    }
}

fn tags_info(table_config: &TableConfig, server_info: &ServerInfo) -> Vec<TagInfo> {
    let table_tags = table_tags(table_config);
    let mut by_tag: BTreeMap<String, TagInfo> = table_tags
        .iter()
        .map(|tag| {
            (
                tag.clone(),
                TagInfo {
                    tag_name: tag.clone(),
                    num_segments_to_download: 0,
                    num_segments_unchanged: 0,
                    num_server_participants: 0,
                },
            )
        })
        .collect();

    for change in server_info.server_segment_change_info.values() {
        if change.total_segments_after_rebalance == 0 {
            continue;
        }
        let mut relevant: Vec<&str> = change
            .tag_list
            .iter()
            .filter(|t| table_tags.contains(*t))
            .map(|t| t.as_str())
            .collect();
        if relevant.is_empty() {
            relevant.push(TAG_FOR_OUTDATED_SERVERS);
        }
        for tag in relevant {
            let info = by_tag.entry(tag.to_string()).or_insert_with(|| TagInfo {
                tag_name: tag.to_string(),
                num_segments_to_download: 0,
                num_segments_unchanged: 0,
                num_server_participants: 0,
            });
            info.num_segments_to_download += change.segments_added;
            info.num_segments_unchanged += change.segments_unchanged;
            info.num_server_participants += 1;
        }
    }
    by_tag.into_values().collect()
}

/// Whether a replica set is still consuming
fn is_consuming(instance_state_map: &tessera_core::InstanceStateMap) -> bool {
    !instance_state_map.values().any(|s| *s == SegmentState::Online)
        && instance_state_map.values().any(|s| *s == SegmentState::Consuming)
}

/// Consuming segments that move between `current` and `target`.
///
/// Offsets are fetched once per stream partition, each under `timeout`.
pub async fn consuming_summary(
    table: &str,
    current: &SegmentAssignment,
    target: &SegmentAssignment,
    segments: &BTreeMap<String, SegmentMetadata>,
    offsets: Option<&dyn StreamOffsetSource>,
    timeout: Duration,
    now_ms: i64,
) -> ConsumingSegmentToBeMovedSummary {
    let moving: Vec<(&String, Vec<&String>)> = current
        .iter()
        .filter(|(_, current_map)| is_consuming(current_map))
        .filter_map(|(segment, current_map)| {
            let target_map = target.get(segment)?;
            let added: Vec<&String> = target_map
                .keys()
                .filter(|instance| !current_map.contains_key(*instance))
                .collect();
            let changed = current_map.keys().ne(target_map.keys());
            changed.then_some((segment, added))
        })
        .collect();

    let partitions: BTreeSet<u32> = moving
        .iter()
        .filter_map(|(segment, _)| segments.get(*segment).map(|m| m.partition()))
        .collect();
    let latest: BTreeMap<u32, Option<i64>> = match offsets {
        Some(source) => {
            let fetches = partitions.iter().map(|&partition| async move {
                let latest = match tokio::time::timeout(timeout, source.latest_offset(table, partition)).await {
                    Ok(Ok(offset)) => offset,
                    Ok(Err(e)) => {
                        warn!(table = %table, partition, error = %e, "Failed to fetch stream offset");
                        None
                    }
                    Err(_) => {
                        warn!(table = %table, partition, "Timed out fetching stream offset");
                        None
                    }
                };
                (partition, latest)
            });
            join_all(fetches).await.into_iter().collect()
        }
        None => BTreeMap::new(),
    };

    let mut offsets_to_catch_up: Vec<RankedSegment> = Vec::new();
    let mut ages: Vec<RankedSegment> = Vec::new();
    let mut per_server: BTreeMap<String, ConsumingServerSummary> = BTreeMap::new();
    let mut all_offsets_known = true;

    for (segment, added) in &moving {
        let metadata = segments.get(*segment);
        let catch_up = metadata.and_then(|m| {
            let start = m.start_offset?;
            let latest = latest.get(&m.partition()).copied().flatten()?;
            Some((latest - start).max(0))
        });
        match catch_up {
            Some(value) => offsets_to_catch_up.push(RankedSegment {
                segment: segment.to_string(),
                value,
            }),
            None => all_offsets_known = false,
        }
        if let Some(metadata) = metadata {
            ages.push(RankedSegment {
                segment: segment.to_string(),
                value: (now_ms - metadata.creation_time_ms).max(0) / 60_000,
            });
        }
        for server in added {
            let summary = per_server
                .entry(server.to_string())
                .or_insert(ConsumingServerSummary {
                    num_consuming_segments_to_be_added: 0,
                    total_offsets_to_catch_up_across_all_consuming_segments: 0,
                });
            summary.num_consuming_segments_to_be_added += 1;
            let total = &mut summary.total_offsets_to_catch_up_across_all_consuming_segments;
            *total = match catch_up {
                Some(value) if *total >= 0 => *total + value,
                _ => -1,
            };
        }
    }

    let top = |mut ranked: Vec<RankedSegment>| {
        ranked.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.segment.cmp(&b.segment)));
        ranked.truncate(TOP_N);
        ranked
    };

    debug!(table = %table, moving = moving.len(), "Computed consuming segment summary");
    ConsumingSegmentToBeMovedSummary {
        num_consuming_segments_to_be_moved: moving.len(),
        num_servers_getting_consuming_segments_added: per_server.len(),
        consuming_segments_to_be_moved_with_most_offsets_to_catch_up: all_offsets_known
            .then(|| top(offsets_to_catch_up)),
        consuming_segments_to_be_moved_with_oldest_age_in_minutes: top(ages),
        server_consuming_segment_summary: per_server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::instance_state_map;

    const TAG: &str = "DefaultTenant_OFFLINE";

    fn make_assignment(entries: &[(&str, &[&str])], state: SegmentState) -> SegmentAssignment {
        entries
            .iter()
            .map(|(segment, instances)| (segment.to_string(), instance_state_map(instances.iter().copied(), state)))
            .collect()
    }

    fn make_instances(n: usize) -> Vec<InstanceConfig> {
        (0..n)
            .map(|i| InstanceConfig::new(format!("server_{}", i), &[TAG]))
            .collect()
    }

    #[test]
    fn test_server_and_segment_counts() {
        let table = TableConfig::offline("orders", 2, TAG);
        let current = make_assignment(
            &[("seg_0", &["server_0", "server_1"]), ("seg_1", &["server_0", "server_1"])],
            SegmentState::Online,
        );
        let target = make_assignment(
            &[("seg_0", &["server_0", "server_2"]), ("seg_1", &["server_1", "server_2"])],
            SegmentState::Online,
        );
        let segments: BTreeMap<String, SegmentMetadata> = ["seg_0", "seg_1"]
            .iter()
            .map(|s| (s.to_string(), SegmentMetadata::new(*s).with_size(100)))
            .collect();

        let summary = compute_summary(&table, &current, &target, &make_instances(3), &segments);
        let servers = &summary.server_info;
        assert_eq!(servers.num_servers.value_before_rebalance, 2);
        assert_eq!(servers.num_servers.expected_value_after_rebalance, 3);
        assert!(servers.servers_added.contains("server_2"));
        assert_eq!(servers.num_servers_getting_new_segments, 1);

        let server_0 = &servers.server_segment_change_info["server_0"];
        assert_eq!(server_0.server_status, ServerStatus::Unchanged);
        assert_eq!((server_0.segments_added, server_0.segments_deleted, server_0.segments_unchanged), (0, 1, 1));
        assert_eq!(server_0.tag_list, vec![TAG.to_string()]);

        let info = &summary.segment_info;
        assert_eq!(info.total_segments_to_be_moved, 2);
        assert_eq!(info.total_segments_to_be_deleted, 2);
        assert_eq!(info.max_segments_added_to_a_single_server, 2);
        assert_eq!(info.estimated_average_segment_size_in_bytes, 100);
        assert_eq!(info.total_estimated_data_to_be_moved_in_bytes, 200);
        assert_eq!(info.num_segments_across_all_replicas.value_before_rebalance, 4);

        let tag = summary.tag(TAG).unwrap();
        assert_eq!(tag.num_segments_to_download, 2);
        assert_eq!(tag.num_segments_unchanged, 2);
        assert_eq!(tag.num_server_participants, 3);
    }

    #[test]
    fn test_outdated_servers_and_unknown_sizes() {
        let table = TableConfig::offline("orders", 1, TAG);
        let current = make_assignment(&[("seg_0", &["old_server"])], SegmentState::Online);
        let target = current.clone();

        let summary = compute_summary(&table, &current, &target, &[], &BTreeMap::new());
        assert_eq!(summary.segment_info.estimated_average_segment_size_in_bytes, -1);
        assert_eq!(summary.segment_info.total_estimated_data_to_be_moved_in_bytes, -1);
        let outdated = summary.tag(TAG_FOR_OUTDATED_SERVERS).unwrap();
        assert_eq!(outdated.num_server_participants, 1);
        assert_eq!(summary.tag(TAG).unwrap().num_server_participants, 0);
    }

    struct FixedOffsets(Option<i64>);

    #[async_trait::async_trait]
    impl StreamOffsetSource for FixedOffsets {
        async fn latest_offset(&self, _table: &str, _partition: u32) -> crate::cluster::ClusterResult<Option<i64>> {
            Ok(self.0)
        }
    }

    fn make_consuming() -> (SegmentAssignment, SegmentAssignment, BTreeMap<String, SegmentMetadata>) {
        let current = make_assignment(
            &[("seg_0", &["server_0"]), ("seg_1", &["server_1"]), ("seg_2", &["server_2"])],
            SegmentState::Consuming,
        );
        let mut target = current.clone();
        target.insert(
            "seg_0".to_string(),
            instance_state_map(["server_3"], SegmentState::Consuming),
        );
        target.insert(
            "seg_1".to_string(),
            instance_state_map(["server_3"], SegmentState::Consuming),
        );
        let segments = [("seg_0", 0u32, 100i64), ("seg_1", 1, 400), ("seg_2", 2, 0)]
            .iter()
            .map(|(name, partition, start)| {
                (
                    name.to_string(),
                    SegmentMetadata::new(*name)
                        .with_partition(*partition)
                        .with_creation_time(0)
                        .consuming(*start),
                )
            })
            .collect();
        (current, target, segments)
    }

    #[tokio::test]
    async fn test_consuming_summary() {
        let (current, target, segments) = make_consuming();
        let source = FixedOffsets(Some(1000));
        let summary = consuming_summary(
            "events_REALTIME",
            &current,
            &target,
            &segments,
            Some(&source),
            Duration::from_secs(1),
            120 * 60_000,
        )
        .await;

        assert_eq!(summary.num_consuming_segments_to_be_moved, 2);
        assert_eq!(summary.num_servers_getting_consuming_segments_added, 1);
        let most = summary
            .consuming_segments_to_be_moved_with_most_offsets_to_catch_up
            .unwrap();
        assert_eq!(most[0], RankedSegment { segment: "seg_0".to_string(), value: 900 });
        assert_eq!(most[1], RankedSegment { segment: "seg_1".to_string(), value: 600 });
        assert_eq!(summary.consuming_segments_to_be_moved_with_oldest_age_in_minutes[0].value, 120);
        let server = &summary.server_consuming_segment_summary["server_3"];
        assert_eq!(server.num_consuming_segments_to_be_added, 2);
        assert_eq!(server.total_offsets_to_catch_up_across_all_consuming_segments, 1500);
    }

    #[tokio::test]
    async fn test_consuming_summary_without_offsets() {
        let (current, target, segments) = make_consuming();
        let source = FixedOffsets(None);
        let summary = consuming_summary(
            "events_REALTIME",
            &current,
            &target,
            &segments,
            Some(&source),
            Duration::from_secs(1),
            0,
        )
        .await;

        assert!(summary
            .consuming_segments_to_be_moved_with_most_offsets_to_catch_up
            .is_none());
        assert_eq!(
            summary.server_consuming_segment_summary["server_3"].total_offsets_to_catch_up_across_all_consuming_segments,
            -1
        );
    }
}
