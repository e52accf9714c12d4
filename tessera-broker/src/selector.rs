//! Replica-group instance selector
//!
//! Picks one server per segment for a query.
//!
//! Round-robin mode indexes each segment's sorted candidates with
//! `(base + replicaOffset) % candidates`, where `base` is the request id (or a
//! stable table hash with fixed-replica routing) and `replicaOffset` cycles
//! through the replica groups the query may touch.
//!
//! Adaptive mode ranks the union of candidates once per request and picks the
//! best ranked candidate of each segment, falling back to round-robin for any
//! segment with an unranked candidate.
//!
//! A selection depends only on its inputs: segments, request id, candidate
//! snapshot, query options and the rank snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

use tessera_core::TableConfig;

use crate::candidate::{SegmentInstanceCandidate, SegmentStates};
use crate::metrics;

/// Query option keys read by the selector
pub mod options {
    /// Number of replica groups a query may spread over
    pub const NUM_REPLICA_GROUPS_TO_QUERY: &str = "numReplicaGroupsToQuery";
    /// "true"/"false", overrides the table's fixed-replica setting
    pub const USE_FIXED_REPLICA: &str = "useFixedReplica";
}

pub type QueryOptions = HashMap<String, String>;

/// Server ordering used by adaptive selection
pub trait ServerRanker: Send + Sync {
    /// Rank `candidates` best first. Servers without stats are left out.
    fn rank(&self, candidates: &[&str]) -> Vec<String>;
}

/// Servers chosen for one query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Segment to server
    pub segments: BTreeMap<String, String>,
    /// Segments routed to a server that has not loaded them yet; a miss on
    /// these is not an error
    pub optional_segments: BTreeMap<String, String>,
    /// Requested segments without any candidate
    pub unavailable_segments: Vec<String>,
}

impl Selection {
    /// Distinct servers the query touches
    pub fn servers(&self) -> BTreeSet<&str> {
        self.segments
            .values()
            .chain(self.optional_segments.values())
            .map(String::as_str)
            .collect()
    }

    fn insert(&mut self, segment: &str, candidate: &SegmentInstanceCandidate) {
        let target = if candidate.online {
            &mut self.segments
        } else {
            &mut self.optional_segments
        };
        target.insert(segment.to_string(), candidate.instance.clone());
    }
}

/// 31-based hash of the table name, as a non-negative value
pub fn fixed_replica_hash(table_name: &str) -> u64 {
    let hash = table_name
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32));
    u64::from(hash.unsigned_abs())
}

/// Replica groups to query; absent, malformed or zero values mean 1
pub fn num_replica_groups_to_query(options: &QueryOptions) -> usize {
    options
        .get(options::NUM_REPLICA_GROUPS_TO_QUERY)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(1)
}

fn use_fixed_replica(options: &QueryOptions, table_default: bool) -> bool {
    match options.get(options::USE_FIXED_REPLICA) {
        Some(v) if v.eq_ignore_ascii_case("true") => true,
        Some(v) if v.eq_ignore_ascii_case("false") => false,
        _ => table_default,
    }
}

/// Selects servers for the segments of one table
pub struct ReplicaGroupInstanceSelector {
    table_name: String,
    table_hash: u64,
    use_fixed_replica: bool,
    ranker: Option<Arc<dyn ServerRanker>>,
}

impl ReplicaGroupInstanceSelector {
    pub fn new(table_name: impl Into<String>, use_fixed_replica: bool) -> Self {
        let table_name = table_name.into();
        Self {
            table_hash: fixed_replica_hash(&table_name),
            table_name,
            use_fixed_replica,
            ranker: None,
        }
    }

    pub fn for_table(config: &TableConfig) -> Self {
        Self::new(config.table_name.clone(), config.routing.use_fixed_replica)
    }

    /// Enable adaptive selection
    pub fn with_ranker(mut self, ranker: Arc<dyn ServerRanker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn select(
        &self,
        segments: &[String],
        request_id: u64,
        states: &SegmentStates,
        options: &QueryOptions,
    ) -> Selection {
        let selection = match &self.ranker {
            Some(ranker) => self.select_adaptive(segments, request_id, states, ranker.as_ref()),
            None => self.select_round_robin(segments, request_id, states, options),
        };
        trace!(
            table = %self.table_name,
            request_id,
            segments = selection.segments.len(),
            optional = selection.optional_segments.len(),
            "Selected servers"
        );
        selection
    }

    fn select_round_robin(
        &self,
        segments: &[String],
        request_id: u64,
        states: &SegmentStates,
        options: &QueryOptions,
    ) -> Selection {
        let base = if use_fixed_replica(options, self.use_fixed_replica) {
            self.table_hash
        } else {
            request_id
        };
        let mut num_replica_groups = num_replica_groups_to_query(options);
        let mut replica_offset = 0usize;
        let mut selection = Selection::default();
        let mut pool_counts: BTreeMap<u32, u64> = BTreeMap::new();

        for segment in segments {
            let Some(candidates) = states.candidates(segment) else {
                selection.unavailable_segments.push(segment.clone());
                continue;
            };
            let count = candidates.len();
            let index = (base.wrapping_add(replica_offset as u64) % count as u64) as usize;
            let selected = &candidates[index];
            *pool_counts.entry(selected.pool).or_insert(0) += 1;
            selection.insert(segment, selected);

            // Never cycle over more replica groups than the segment has candidates
            if num_replica_groups > count {
                num_replica_groups = count;
            }
            replica_offset = (replica_offset + 1) % num_replica_groups;
        }

        metrics::record_pool_segments(&pool_counts);
        selection
    }

    fn select_adaptive(
        &self,
        segments: &[String],
        request_id: u64,
        states: &SegmentStates,
        ranker: &dyn ServerRanker,
    ) -> Selection {
        // One rank snapshot for the whole request
        let union: BTreeSet<&str> = segments
            .iter()
            .filter_map(|segment| states.candidates(segment))
            .flatten()
            .map(|c| c.instance.as_str())
            .collect();
        let union: Vec<&str> = union.into_iter().collect();
        let ranks: HashMap<String, usize> = ranker
            .rank(&union)
            .into_iter()
            .enumerate()
            .map(|(rank, instance)| (instance, rank))
            .collect();

        let mut selection = Selection::default();
        let mut pool_counts: BTreeMap<u32, u64> = BTreeMap::new();

        for segment in segments {
            let Some(candidates) = states.candidates(segment) else {
                selection.unavailable_segments.push(segment.clone());
                continue;
            };
            let round_robin = &candidates[(request_id % candidates.len() as u64) as usize];
            let all_ranked = !ranks.is_empty() && candidates.iter().all(|c| ranks.contains_key(&c.instance));
            let selected = if all_ranked {
                candidates
                    .iter()
                    .min_by_key(|c| ranks.get(&c.instance).copied().unwrap_or(usize::MAX))
                    .unwrap_or(round_robin)
            } else {
                round_robin
            };
            *pool_counts.entry(selected.pool).or_insert(0) += 1;
            selection.insert(segment, selected);
        }

        metrics::record_pool_segments(&pool_counts);
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// `segments` segments, each with the same `replicas` online candidates
    fn make_states(segments: usize, replicas: usize) -> (Vec<String>, SegmentStates) {
        let names: Vec<String> = (0..segments).map(|i| format!("seg_{}", i)).collect();
        let candidates = names
            .iter()
            .map(|segment| {
                let list = (0..replicas)
                    .map(|r| SegmentInstanceCandidate::new(format!("server_{}", r), true).with_pool(r as u32))
                    .collect();
                (segment.clone(), list)
            })
            .collect();
        (names, SegmentStates::new(candidates, BTreeSet::new()))
    }

    fn make_options(entries: &[(&str, &str)]) -> QueryOptions {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct FixedRanker {
        order: Vec<String>,
        calls: AtomicUsize,
    }

    impl FixedRanker {
        fn new(order: &[&str]) -> Self {
            Self {
                order: order.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ServerRanker for FixedRanker {
        fn rank(&self, candidates: &[&str]) -> Vec<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order
                .iter()
                .filter(|s| candidates.contains(&s.as_str()))
                .cloned()
                .collect()
        }
    }

    #[test]
    fn test_round_robin_single_replica_group() {
        let (segments, states) = make_states(4, 3);
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);

        for request_id in 0..3u64 {
            let selection = selector.select(&segments, request_id, &states, &QueryOptions::new());
            let expected = format!("server_{}", request_id);
            assert!(selection.segments.values().all(|s| *s == expected));
            assert_eq!(selection.servers().len(), 1);
        }
    }

    #[test]
    fn test_multiple_replica_groups() {
        let (segments, states) = make_states(4, 3);
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
        let options = make_options(&[(options::NUM_REPLICA_GROUPS_TO_QUERY, "2")]);

        let selection = selector.select(&segments, 1, &states, &options);
        let chosen: Vec<&str> = segments.iter().map(|s| selection.segments[s].as_str()).collect();
        assert_eq!(chosen, vec!["server_1", "server_2", "server_1", "server_2"]);
    }

    #[test]
    fn test_replica_groups_clamped_to_candidates() {
        let (segments, states) = make_states(6, 2);
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
        let options = make_options(&[(options::NUM_REPLICA_GROUPS_TO_QUERY, "5")]);

        let selection = selector.select(&segments, 0, &states, &options);
        let chosen: Vec<&str> = segments.iter().map(|s| selection.segments[s].as_str()).collect();
        assert_eq!(
            chosen,
            vec!["server_0", "server_1", "server_0", "server_1", "server_0", "server_1"]
        );
    }

    #[test]
    fn test_invalid_replica_group_count_falls_back_to_one() {
        for value in ["0", "abc", "-2", ""] {
            let options = make_options(&[(options::NUM_REPLICA_GROUPS_TO_QUERY, value)]);
            assert_eq!(num_replica_groups_to_query(&options), 1, "{:?}", value);
        }
        assert_eq!(num_replica_groups_to_query(&QueryOptions::new()), 1);
    }

    #[test]
    fn test_fixed_replica_hash() {
        assert_eq!(fixed_replica_hash(""), 0);
        assert_eq!(fixed_replica_hash("a"), 97);
        assert_eq!(fixed_replica_hash("hello"), 99_162_322);
        // Hashes to i32::MIN
        assert_eq!(fixed_replica_hash("polygenelubricants"), 2_147_483_648);
    }

    #[test]
    fn test_fixed_replica_ignores_request_id() {
        let (segments, states) = make_states(3, 3);
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", true);
        let expected = format!("server_{}", fixed_replica_hash("orders_OFFLINE") % 3);

        for request_id in 0..5u64 {
            let selection = selector.select(&segments, request_id, &states, &QueryOptions::new());
            assert!(selection.segments.values().all(|s| *s == expected));
        }
    }

    #[test]
    fn test_query_option_overrides_fixed_replica() {
        let (segments, states) = make_states(2, 3);
        let fixed = ReplicaGroupInstanceSelector::new("orders_OFFLINE", true);
        let off = make_options(&[(options::USE_FIXED_REPLICA, "false")]);
        let selection = fixed.select(&segments, 2, &states, &off);
        assert_eq!(selection.segments["seg_0"], "server_2");

        let plain = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
        let on = make_options(&[(options::USE_FIXED_REPLICA, "TRUE")]);
        let a = plain.select(&segments, 0, &states, &on);
        let b = plain.select(&segments, 1, &states, &on);
        assert_eq!(a, b);
    }

    #[test]
    fn test_offline_candidates_are_optional() {
        let mut candidates = HashMap::new();
        candidates.insert(
            "seg_new".to_string(),
            vec![
                SegmentInstanceCandidate::new("server_0", false),
                SegmentInstanceCandidate::new("server_1", true),
            ],
        );
        let states = SegmentStates::new(candidates, BTreeSet::new());
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
        let segments = vec!["seg_new".to_string(), "seg_missing".to_string()];

        let selection = selector.select(&segments, 0, &states, &QueryOptions::new());
        assert!(selection.segments.is_empty());
        assert_eq!(selection.optional_segments["seg_new"], "server_0");
        assert_eq!(selection.unavailable_segments, vec!["seg_missing".to_string()]);

        let selection = selector.select(&segments, 1, &states, &QueryOptions::new());
        assert_eq!(selection.segments["seg_new"], "server_1");
        assert!(selection.optional_segments.is_empty());
    }

    #[test]
    fn test_adaptive_picks_best_ranked() {
        let (segments, states) = make_states(3, 3);
        let ranker = Arc::new(FixedRanker::new(&["server_2", "server_0", "server_1"]));
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false).with_ranker(ranker.clone());

        let selection = selector.select(&segments, 0, &states, &QueryOptions::new());
        assert!(selection.segments.values().all(|s| s == "server_2"));
        assert_eq!(ranker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_adaptive_falls_back_when_partially_ranked() {
        let (segments, states) = make_states(2, 3);
        let ranker = Arc::new(FixedRanker::new(&["server_2", "server_0"]));
        let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false).with_ranker(ranker);

        let selection = selector.select(&segments, 1, &states, &QueryOptions::new());
        assert!(selection.segments.values().all(|s| s == "server_1"));
    }

    #[test]
    fn test_adaptive_without_stats_is_round_robin() {
        let (segments, states) = make_states(2, 3);
        let selector =
            ReplicaGroupInstanceSelector::new("orders_OFFLINE", false).with_ranker(Arc::new(FixedRanker::new(&[])));

        let selection = selector.select(&segments, 5, &states, &QueryOptions::new());
        assert!(selection.segments.values().all(|s| s == "server_2"));
    }

    #[test]
    fn test_segment_without_candidates_is_unavailable() {
        let mut candidates = HashMap::new();
        candidates.insert("seg_0".to_string(), vec![]);
        candidates.insert("seg_1".to_string(), vec![SegmentInstanceCandidate::new("server_0", true)]);
        let states = SegmentStates::new(candidates, BTreeSet::new());
        let segments = vec!["seg_0".to_string(), "seg_1".to_string()];

        let round_robin = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
        let adaptive = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false)
            .with_ranker(Arc::new(FixedRanker::new(&["server_0"])));
        for selector in [round_robin, adaptive] {
            let selection = selector.select(&segments, 7, &states, &QueryOptions::new());
            assert_eq!(selection.unavailable_segments, vec!["seg_0".to_string()]);
            assert_eq!(selection.segments["seg_1"], "server_0");
            assert!(!selection.segments.contains_key("seg_0"));
        }
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic(
            segments in 1usize..20,
            replicas in 1usize..5,
            request_id in any::<u64>(),
            groups in 1usize..6,
        ) {
            let (names, states) = make_states(segments, replicas);
            let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
            let options = make_options(&[(options::NUM_REPLICA_GROUPS_TO_QUERY, groups.to_string().as_str())]);
            let first = selector.select(&names, request_id, &states, &options);
            let second = selector.select(&names, request_id, &states, &options);
            prop_assert_eq!(first.segments.len(), segments);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_servers_touched_bounded_by_replica_groups(
            segments in 1usize..30,
            replicas in 1usize..6,
            request_id in 0u64..1000,
            groups in 1usize..8,
        ) {
            let (names, states) = make_states(segments, replicas);
            let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
            let options = make_options(&[(options::NUM_REPLICA_GROUPS_TO_QUERY, groups.to_string().as_str())]);
            let selection = selector.select(&names, request_id, &states, &options);
            prop_assert!(selection.servers().len() <= groups.min(replicas).min(segments));
        }

        #[test]
        fn prop_round_robin_spreads_requests_evenly(replicas in 1usize..6, start in 0u64..1000) {
            let (names, states) = make_states(1, replicas);
            let selector = ReplicaGroupInstanceSelector::new("orders_OFFLINE", false);
            let mut hits: BTreeMap<String, usize> = BTreeMap::new();
            for request_id in start..start + replicas as u64 {
                let selection = selector.select(&names, request_id, &states, &QueryOptions::new());
                *hits.entry(selection.segments["seg_0"].clone()).or_insert(0) += 1;
            }
            prop_assert_eq!(hits.len(), replicas);
            prop_assert!(hits.values().all(|&n| n == 1));
        }
    }
}
