//! Segment assignment types
//!
//! An assignment maps segment name -> server id -> state. Ideal state and
//! external view share the same shape. Ordered maps keep equality and
//! serialization deterministic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// State of a segment replica on a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SegmentState {
    Online,
    Consuming,
    Offline,
    /// Only reported by servers in the external view
    Error,
}

impl SegmentState {
    /// Whether a replica in this state can serve queries
    pub fn is_serving(self) -> bool {
        matches!(self, SegmentState::Online | SegmentState::Consuming)
    }
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentState::Online => "ONLINE",
            SegmentState::Consuming => "CONSUMING",
            SegmentState::Offline => "OFFLINE",
            SegmentState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Server id -> replica state for one segment
pub type InstanceStateMap = BTreeMap<String, SegmentState>;

/// Segment name -> instance state map for one table
pub type SegmentAssignment = BTreeMap<String, InstanceStateMap>;

/// Live segment states as reported by servers
pub type ExternalView = SegmentAssignment;

/// Versioned ideal state of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdealState {
    pub table_name: String,
    /// Bumped on every successful write
    pub version: u64,
    pub assignment: SegmentAssignment,
}

impl IdealState {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            version: 0,
            assignment: SegmentAssignment::new(),
        }
    }
}

/// Build an instance state map with every instance in the same state
pub fn instance_state_map<I, S>(instances: I, state: SegmentState) -> InstanceStateMap
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    instances.into_iter().map(|i| (i.into(), state)).collect()
}

/// Invert an assignment into server id -> hosted segments
pub fn instance_to_segments(assignment: &SegmentAssignment) -> BTreeMap<String, BTreeSet<String>> {
    let mut result: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (segment, instance_state_map) in assignment {
        for instance in instance_state_map.keys() {
            result
                .entry(instance.clone())
                .or_default()
                .insert(segment.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_to_segments() {
        let mut assignment = SegmentAssignment::new();
        assignment.insert(
            "seg_0".to_string(),
            instance_state_map(["server_0", "server_1"], SegmentState::Online),
        );
        assignment.insert(
            "seg_1".to_string(),
            instance_state_map(["server_1"], SegmentState::Consuming),
        );

        let inverted = instance_to_segments(&assignment);
        assert_eq!(inverted["server_0"].len(), 1);
        assert_eq!(inverted["server_1"].len(), 2);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SegmentState::Consuming).unwrap();
        assert_eq!(json, "\"CONSUMING\"");
        assert!(SegmentState::Online.is_serving());
        assert!(!SegmentState::Offline.is_serving());
    }
}
