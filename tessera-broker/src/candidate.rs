//! Segment instance candidates
//!
//! Derives, from an ideal state and an external view, the servers each
//! segment may be routed to:
//! - A candidate is an enabled server the ideal state assigns the segment to
//! - It is online when the external view reports it serving
//! - New segments keep offline candidates so queries can still reach them as
//!   optional segments; older segments keep only online ones
//!
//! Candidates are sorted by instance id, so every broker derives the same
//! round-robin order.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::debug;

use tessera_core::{ExternalView, IdealState, InstanceConfig, SegmentState, DEFAULT_POOL};

/// A server that can serve one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInstanceCandidate {
    pub instance: String,
    /// False only for new segments not yet loaded on this server
    pub online: bool,
    pub pool: u32,
}

impl SegmentInstanceCandidate {
    pub fn new(instance: impl Into<String>, online: bool) -> Self {
        Self {
            instance: instance.into(),
            online,
            pool: DEFAULT_POOL,
        }
    }

    pub fn with_pool(mut self, pool: u32) -> Self {
        self.pool = pool;
        self
    }
}

/// Routing candidates for every segment of a table
#[derive(Debug, Clone, Default)]
pub struct SegmentStates {
    candidates: HashMap<String, Vec<SegmentInstanceCandidate>>,
    unavailable: BTreeSet<String>,
    /// Ideal state version the candidates were built from
    version: u64,
}

impl SegmentStates {
    /// Build from explicit candidate lists; each list is sorted by instance.
    /// Segments with an empty list are moved to the unavailable set.
    pub fn new(candidates: HashMap<String, Vec<SegmentInstanceCandidate>>, mut unavailable: BTreeSet<String>) -> Self {
        let candidates = candidates
            .into_iter()
            .filter_map(|(segment, mut list)| {
                if list.is_empty() {
                    unavailable.insert(segment);
                    return None;
                }
                list.sort_by(|a, b| a.instance.cmp(&b.instance));
                Some((segment, list))
            })
            .collect();
        Self {
            candidates,
            unavailable,
            version: 0,
        }
    }

    /// `None` for unknown segments and segments without any candidate
    pub fn candidates(&self, segment: &str) -> Option<&[SegmentInstanceCandidate]> {
        self.candidates.get(segment).map(Vec::as_slice)
    }

    /// Segments of the ideal state no server can serve
    pub fn unavailable_segments(&self) -> &BTreeSet<String> {
        &self.unavailable
    }

    pub fn num_segments(&self) -> usize {
        self.candidates.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Cluster inputs that change independently of the ideal state
#[derive(Debug, Clone, Copy)]
pub struct CandidateContext<'a> {
    pub instances: &'a [InstanceConfig],
    /// Creation time of segments, by name; segments missing here are old
    pub segment_creation_ms: &'a BTreeMap<String, i64>,
    pub now_ms: i64,
    pub new_segment_expiration: Duration,
}

impl CandidateContext<'_> {
    fn is_new(&self, segment: &str) -> bool {
        self.segment_creation_ms
            .get(segment)
            .is_some_and(|&created| self.now_ms.saturating_sub(created) <= self.new_segment_expiration.as_millis() as i64)
    }
}

/// Candidate lists for every segment of `ideal_state`
pub fn build_segment_states(
    ideal_state: &IdealState,
    external_view: &ExternalView,
    ctx: &CandidateContext<'_>,
) -> SegmentStates {
    let enabled: HashMap<&str, u32> = ctx
        .instances
        .iter()
        .filter(|i| i.enabled)
        .map(|i| (i.id.as_str(), i.pool))
        .collect();

    let mut candidates = HashMap::with_capacity(ideal_state.assignment.len());
    let mut unavailable = BTreeSet::new();

    for (segment, instance_state_map) in &ideal_state.assignment {
        let reported = external_view.get(segment);
        // A replica in ERROR means the segment has been loaded before
        let has_error = reported.is_some_and(|m| m.values().any(|s| *s == SegmentState::Error));
        let is_new = !has_error && ctx.is_new(segment);

        let list: Vec<SegmentInstanceCandidate> = instance_state_map
            .iter()
            .filter(|(_, state)| state.is_serving())
            .filter_map(|(instance, _)| {
                let pool = *enabled.get(instance.as_str())?;
                let online = reported
                    .and_then(|m| m.get(instance))
                    .is_some_and(|s| s.is_serving());
                (online || is_new).then(|| SegmentInstanceCandidate::new(instance.clone(), online).with_pool(pool))
            })
            .collect();

        if list.is_empty() {
            unavailable.insert(segment.clone());
        } else {
            candidates.insert(segment.clone(), list);
        }
    }

    debug!(
        table = %ideal_state.table_name,
        segments = candidates.len(),
        unavailable = unavailable.len(),
        "Built segment candidates"
    );
    let mut states = SegmentStates::new(candidates, unavailable);
    states.version = ideal_state.version;
    states
}
