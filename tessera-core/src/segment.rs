//! Segment metadata

use serde::{Deserialize, Serialize};

/// Ingestion status of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    /// Sealed, data fully available
    #[default]
    Done,
    /// Still consuming from the stream
    InProgress,
}

/// Metadata the placement engine reads for a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMetadata {
    pub name: String,
    #[serde(default)]
    pub partition_id: Option<u32>,
    #[serde(default)]
    pub start_time_ms: Option<i64>,
    #[serde(default)]
    pub end_time_ms: Option<i64>,
    #[serde(default)]
    pub creation_time_ms: i64,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub total_docs: u64,
    #[serde(default)]
    pub status: SegmentStatus,
    /// Stream offset the segment started consuming from
    #[serde(default)]
    pub start_offset: Option<i64>,
    /// Tier the segment was last placed on
    #[serde(default)]
    pub target_tier: Option<String>,
}

impl SegmentMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_id: None,
            start_time_ms: None,
            end_time_ms: None,
            creation_time_ms: 0,
            size_bytes: 0,
            total_docs: 0,
            status: SegmentStatus::Done,
            start_offset: None,
            target_tier: None,
        }
    }

    pub fn with_partition(mut self, partition_id: u32) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    pub fn with_end_time(mut self, end_time_ms: i64) -> Self {
        self.end_time_ms = Some(end_time_ms);
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn with_creation_time(mut self, creation_time_ms: i64) -> Self {
        self.creation_time_ms = creation_time_ms;
        self
    }

    /// Mark as a consuming segment starting at the given stream offset
    pub fn consuming(mut self, start_offset: i64) -> Self {
        self.status = SegmentStatus::InProgress;
        self.start_offset = Some(start_offset);
        self
    }

    pub fn is_consuming(&self) -> bool {
        self.status == SegmentStatus::InProgress
    }

    /// Partition id, defaulting to 0 for unpartitioned segments
    pub fn partition(&self) -> u32 {
        self.partition_id.unwrap_or(0)
    }
}
