//! Rebalance job options and results
//!
//! - `RebalanceConfig`: per-job options, camelCase on the wire
//! - `RebalanceResult`: status, computed assignments, summary and pre-checks
//! - `RebalanceProgress`: step updates published while a job runs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use tessera_core::{InstancePartitions, InstancePartitionsType, Result, SegmentAssignment, TesseraError};

use crate::precheck::PreCheckResult;
use crate::summary::RebalanceSummaryResult;

/// Sentinel for `batchSizePerServer` that disables batching
pub const DISABLE_BATCH_SIZE_PER_SERVER: i32 = -1;

/// Tri-state override for a table-level flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum Enablement {
    Enable,
    Disable,
    #[default]
    Default,
}

impl Enablement {
    /// `None` defers to the table config
    pub fn resolve(self) -> Option<bool> {
        match self {
            Enablement::Enable => Some(true),
            Enablement::Disable => Some(false),
            Enablement::Default => None,
        }
    }
}

/// Options for a single rebalance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebalanceConfig {
    /// Compute and report without writing
    pub dry_run: bool,
    /// Run advisory pre-checks (dry run only)
    pub pre_checks: bool,
    /// Recompute instance partitions
    pub reassign_instances: bool,
    /// Move consuming segments too
    pub include_consuming: bool,
    /// Ignore the current assignment
    pub bootstrap: bool,
    /// Write the target in one step without availability guarantees
    pub downtime: bool,
    /// Replicas kept serving per segment; negative means `replication + value`
    pub min_available_replicas: i32,
    /// Segments added per server per step, or `DISABLE_BATCH_SIZE_PER_SERVER`
    pub batch_size_per_server: i32,
    /// Continue past external view timeouts and ERROR replicas
    pub best_efforts: bool,
    pub minimize_data_movement: Enablement,
    /// Record each segment's tier in its metadata
    pub update_target_tier: bool,
    /// Overrides the service's disk utilization threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_utilization_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_view_check_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_view_stabilization_timeout_ms: Option<u64>,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            pre_checks: false,
            reassign_instances: false,
            include_consuming: false,
            bootstrap: false,
            downtime: false,
            min_available_replicas: 1,
            batch_size_per_server: DISABLE_BATCH_SIZE_PER_SERVER,
            best_efforts: false,
            minimize_data_movement: Enablement::Default,
            update_target_tier: false,
            disk_utilization_threshold: None,
            external_view_check_interval_ms: None,
            external_view_stabilization_timeout_ms: None,
        }
    }
}

impl RebalanceConfig {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    /// Checks that need no cluster state
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_per_server != DISABLE_BATCH_SIZE_PER_SERVER && self.batch_size_per_server < 1 {
            return Err(TesseraError::InvalidConfig(format!(
                "batchSizePerServer must be {} or positive, got {}",
                DISABLE_BATCH_SIZE_PER_SERVER, self.batch_size_per_server
            )));
        }
        if let Some(threshold) = self.disk_utilization_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(TesseraError::InvalidConfig(format!(
                    "diskUtilizationThreshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }

    /// `None` when batching is disabled
    pub fn batch_size(&self) -> Option<usize> {
        (self.batch_size_per_server > 0).then_some(self.batch_size_per_server as usize)
    }

    /// Effective minimum available replicas for a table replication
    pub fn min_available_for(&self, replication: usize) -> usize {
        if self.downtime {
            return 0;
        }
        if self.min_available_replicas >= 0 {
            self.min_available_replicas as usize
        } else {
            (replication as i64 + self.min_available_replicas as i64).max(0) as usize
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceStatus {
    NoOp,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for RebalanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebalanceStatus::NoOp => "NO_OP",
            RebalanceStatus::Done => "DONE",
            RebalanceStatus::Failed => "FAILED",
            RebalanceStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Outcome of one rebalance call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceResult {
    pub job_id: String,
    pub status: RebalanceStatus,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_assignment: Option<BTreeMap<InstancePartitionsType, InstancePartitions>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_instance_assignment: Option<BTreeMap<String, InstancePartitions>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_assignment: Option<SegmentAssignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebalance_summary_result: Option<RebalanceSummaryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_checks_result: Option<BTreeMap<String, PreCheckResult>>,
}

impl RebalanceResult {
    /// A result carrying only a status and message
    pub fn bare(job_id: impl Into<String>, status: RebalanceStatus, description: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            description: description.into(),
            instance_assignment: None,
            tier_instance_assignment: None,
            segment_assignment: None,
            rebalance_summary_result: None,
            pre_checks_result: None,
        }
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        match &self.rebalance_summary_result {
            Some(summary) => format!(
                "{}: {} ({} segments to move, {} to delete)",
                self.status,
                self.description,
                summary.segment_info.total_segments_to_be_moved,
                summary.segment_info.total_segments_to_be_deleted
            ),
            None => format!("{}: {}", self.status, self.description),
        }
    }
}

/// Progress update for a running job
#[derive(Debug, Clone)]
pub struct RebalanceProgress {
    pub job_id: String,
    pub step: usize,
    /// Segments whose instance state map changed in this step
    pub segments_updated: usize,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressStatus {
    Running,
    Converged,
    Completed(RebalanceStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RebalanceConfig::default();
        assert_eq!(config.min_available_replicas, 1);
        assert_eq!(config.batch_size_per_server, DISABLE_BATCH_SIZE_PER_SERVER);
        assert!(config.batch_size().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_size_validation() {
        for invalid in [0, -2, -100] {
            let config = RebalanceConfig {
                batch_size_per_server: invalid,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(TesseraError::InvalidConfig(_))));
        }
        let config = RebalanceConfig {
            batch_size_per_server: 2,
            ..Default::default()
        };
        assert_eq!(config.batch_size(), Some(2));
    }

    #[test]
    fn test_min_available_for() {
        let mut config = RebalanceConfig::default();
        assert_eq!(config.min_available_for(3), 1);

        config.min_available_replicas = -1;
        assert_eq!(config.min_available_for(3), 2);

        config.min_available_replicas = -5;
        assert_eq!(config.min_available_for(3), 0);

        config.min_available_replicas = 2;
        config.downtime = true;
        assert_eq!(config.min_available_for(3), 0);
    }

    #[test]
    fn test_camel_case_wire_format() {
        let config: RebalanceConfig =
            serde_json::from_str(r#"{"dryRun": true, "batchSizePerServer": 10, "minimizeDataMovement": "ENABLE"}"#)
                .unwrap();
        assert!(config.dry_run);
        assert_eq!(config.batch_size(), Some(10));
        assert_eq!(config.minimize_data_movement.resolve(), Some(true));
        assert_eq!(config.min_available_replicas, 1);

        let json = serde_json::to_value(RebalanceStatus::NoOp).unwrap();
        assert_eq!(json, "NO_OP");
    }
}
