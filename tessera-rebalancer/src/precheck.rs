//! Rebalance pre-checks
//!
//! Advisory checks run alongside a dry run:
//! - Whether servers need a segment reload first
//! - Whether minimizeDataMovement is in effect
//! - Projected disk utilization during and after the rebalance
//! - Risky rebalance options
//! - Replica group layout
//!
//! Remote calls run concurrently under a semaphore, each with its own timeout.
//! A failed or timed-out call degrades its check to ERROR and never aborts
//! the rebalance.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use tessera_core::{DiskUsageInfo, SegmentAssignment, TableConfig};

use crate::cluster::{DiskUsageSource, ReloadStatusProbe};
use crate::config::RebalancerConfig;
use crate::job::RebalanceConfig;
use crate::metrics;
use crate::summary::RebalanceSummaryResult;

pub const NEEDS_RELOAD_STATUS: &str = "needsReloadStatus";
pub const IS_MINIMIZE_DATA_MOVEMENT: &str = "isMinimizeDataMovement";
pub const DISK_UTILIZATION_DURING_REBALANCE: &str = "diskUtilizationDuringRebalance";
pub const DISK_UTILIZATION_AFTER_REBALANCE: &str = "diskUtilizationAfterRebalance";
pub const REBALANCE_CONFIG_OPTIONS: &str = "rebalanceConfigOptions";
pub const REPLICA_GROUPS_INFO: &str = "replicaGroupsInfo";

/// Segments added to one server above which batching is recommended
pub const SEGMENT_ADD_THRESHOLD: usize = 200;
pub const RECOMMENDED_BATCH_SIZE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PreCheckStatus {
    Pass,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreCheckResult {
    pub pre_check_status: PreCheckStatus,
    pub message: String,
}

impl PreCheckResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            pre_check_status: PreCheckStatus::Pass,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            pre_check_status: PreCheckStatus::Warn,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            pre_check_status: PreCheckStatus::Error,
            message: message.into(),
        }
    }
}

/// Pre-checker configuration
#[derive(Debug, Clone)]
pub struct PreCheckConfig {
    /// Timeout per remote call
    pub timeout: Duration,
    /// Maximum concurrent remote calls
    pub parallelism: usize,
    /// Utilization above which a server is unsafe
    pub disk_utilization_threshold: f64,
}

impl Default for PreCheckConfig {
    fn default() -> Self {
        Self::from(&RebalancerConfig::default())
    }
}

impl From<&RebalancerConfig> for PreCheckConfig {
    fn from(config: &RebalancerConfig) -> Self {
        Self {
            timeout: config.pre_check_timeout(),
            parallelism: config.pre_check_parallelism.max(1),
            disk_utilization_threshold: config.disk_utilization_threshold,
        }
    }
}

/// Inputs shared by every check
pub struct PreCheckContext<'a> {
    pub table_config: &'a TableConfig,
    pub rebalance_config: &'a RebalanceConfig,
    pub current: &'a SegmentAssignment,
    pub target: &'a SegmentAssignment,
    pub summary: &'a RebalanceSummaryResult,
}

/// Runs the pre-checks for one rebalance
pub struct RebalancePreChecker {
    config: PreCheckConfig,
    reload_probe: Option<Arc<dyn ReloadStatusProbe>>,
    disk_usage: Option<Arc<dyn DiskUsageSource>>,
    semaphore: Arc<Semaphore>,
}

impl RebalancePreChecker {
    pub fn new(config: PreCheckConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
        Self {
            config,
            reload_probe: None,
            disk_usage: None,
            semaphore,
        }
    }

    pub fn with_reload_probe(mut self, probe: Arc<dyn ReloadStatusProbe>) -> Self {
        self.reload_probe = Some(probe);
        self
    }

    pub fn with_disk_usage(mut self, source: Arc<dyn DiskUsageSource>) -> Self {
        self.disk_usage = Some(source);
        self
    }

    /// Run every check
    #[instrument(skip_all, fields(table = %ctx.table_config.table_name))]
    pub async fn check(&self, ctx: &PreCheckContext<'_>) -> BTreeMap<String, PreCheckResult> {
        let (reload, (during, after)) = tokio::join!(self.check_reload(ctx), self.check_disk_utilization(ctx));

        let mut results = BTreeMap::new();
        results.insert(NEEDS_RELOAD_STATUS.to_string(), reload);
        results.insert(IS_MINIMIZE_DATA_MOVEMENT.to_string(), check_minimize_data_movement(ctx));
        results.insert(DISK_UTILIZATION_DURING_REBALANCE.to_string(), during);
        results.insert(DISK_UTILIZATION_AFTER_REBALANCE.to_string(), after);
        results.insert(REBALANCE_CONFIG_OPTIONS.to_string(), check_rebalance_config(ctx));
        results.insert(REPLICA_GROUPS_INFO.to_string(), check_replica_groups(ctx));

        for (name, result) in &results {
            if result.pre_check_status == PreCheckStatus::Error {
                metrics::record_pre_check_error(check_name(name));
            }
        }
        debug!(checks = results.len(), "Pre-checks complete");
        results
    }

    async fn check_reload(&self, ctx: &PreCheckContext<'_>) -> PreCheckResult {
        const UNKNOWN: &str = "Could not determine needReload status, run needReload API manually";

        let Some(probe) = &self.reload_probe else {
            return PreCheckResult::error(UNKNOWN);
        };
        let servers: BTreeSet<&String> = ctx.current.values().flat_map(|m| m.keys()).collect();
        let table = ctx.table_config.table_name.as_str();

        let probes = servers.into_iter().map(|server| {
            let probe = Arc::clone(probe);
            let semaphore = Arc::clone(&self.semaphore);
            let timeout = self.config.timeout;
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match tokio::time::timeout(timeout, probe.needs_reload(server, table)).await {
                    Ok(Ok(needs_reload)) => Some(needs_reload),
                    Ok(Err(e)) => {
                        warn!(server = %server, error = %e, "Reload status probe failed");
                        None
                    }
                    Err(_) => {
                        warn!(server = %server, "Reload status probe timed out");
                        None
                    }
                }
            }
        });
        let statuses = join_all(probes).await;

        if statuses.iter().any(Option::is_none) {
            PreCheckResult::error(UNKNOWN)
        } else if statuses.iter().any(|s| *s == Some(true)) {
            PreCheckResult::warn("Reload needed prior to running rebalance")
        } else {
            PreCheckResult::pass("No need to reload")
        }
    }

    async fn check_disk_utilization(&self, ctx: &PreCheckContext<'_>) -> (PreCheckResult, PreCheckResult) {
        let threshold = ctx
            .rebalance_config
            .disk_utilization_threshold
            .unwrap_or(self.config.disk_utilization_threshold);
        let average = ctx
            .summary
            .segment_info
            .estimated_average_segment_size_in_bytes
            .max(0);
        let changes: Vec<(&String, i64, i64)> = ctx
            .summary
            .server_info
            .server_segment_change_info
            .iter()
            .filter(|(_, c)| c.total_segments_after_rebalance > 0)
            .map(|(server, c)| (server, c.segments_added as i64, c.segments_deleted as i64))
            .collect();

        let usages: Vec<Option<DiskUsageInfo>> = match &self.disk_usage {
            Some(source) => {
                let fetches = changes.iter().map(|(server, _, _)| {
                    let source = Arc::clone(source);
                    let semaphore = Arc::clone(&self.semaphore);
                    let timeout = self.config.timeout;
                    async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        match tokio::time::timeout(timeout, source.disk_usage(server)).await {
                            Ok(Ok(usage)) => usage,
                            Ok(Err(e)) => {
                                warn!(server = %server, error = %e, "Disk usage fetch failed");
                                None
                            }
                            Err(_) => {
                                warn!(server = %server, "Disk usage fetch timed out");
                                None
                            }
                        }
                    }
                });
                join_all(fetches).await
            }
            None => vec![None; changes.len()],
        };

        let missing: Vec<&str> = changes
            .iter()
            .zip(&usages)
            .filter(|(_, usage)| usage.is_none())
            .map(|((server, _, _), _)| server.as_str())
            .collect();
        if !missing.is_empty() {
            let message = format!("Disk usage info not available for servers: {}", missing.join(", "));
            return (PreCheckResult::error(message.clone()), PreCheckResult::error(message));
        }

        let evaluate = |delta_of: &dyn Fn(i64, i64) -> i64| {
            let unsafe_servers: Vec<String> = changes
                .iter()
                .zip(&usages)
                .filter_map(|((server, added, deleted), usage)| {
                    let utilization = usage.as_ref()?.projected_utilization(delta_of(*added, *deleted) * average);
                    (utilization > threshold).then(|| format!("{} ({}%)", server, percent(utilization)))
                })
                .collect();
            if unsafe_servers.is_empty() {
                PreCheckResult::pass(format!("Within threshold (<{}%)", percent(threshold)))
            } else {
                PreCheckResult::error(format!(
                    "UNSAFE. Servers with unsafe disk utilization (>{}%): {}",
                    percent(threshold),
                    unsafe_servers.join(", ")
                ))
            }
        };

        (
            evaluate(&|added, _| added),
            evaluate(&|added, deleted| added - deleted),
        )
    }
}

fn percent(fraction: f64) -> String {
    format!("{:.0}", fraction * 100.0)
}

fn check_name(name: &str) -> &'static str {
    match name {
        NEEDS_RELOAD_STATUS => NEEDS_RELOAD_STATUS,
        IS_MINIMIZE_DATA_MOVEMENT => IS_MINIMIZE_DATA_MOVEMENT,
        DISK_UTILIZATION_DURING_REBALANCE => DISK_UTILIZATION_DURING_REBALANCE,
        DISK_UTILIZATION_AFTER_REBALANCE => DISK_UTILIZATION_AFTER_REBALANCE,
        REBALANCE_CONFIG_OPTIONS => REBALANCE_CONFIG_OPTIONS,
        _ => REPLICA_GROUPS_INFO,
    }
}

fn check_minimize_data_movement(ctx: &PreCheckContext<'_>) -> PreCheckResult {
    const ENABLED: &str = "minimizeDataMovement is enabled";
    const NOT_ENABLED: &str = "minimizeDataMovement is not enabled but instance assignment is allowed";

    if !ctx.table_config.allows_instance_assignment() {
        return PreCheckResult::pass("Instance assignment not allowed, no need for minimizeDataMovement");
    }
    let enabled = ctx
        .rebalance_config
        .minimize_data_movement
        .resolve()
        .unwrap_or_else(|| {
            ctx.table_config
                .instance_assignment
                .values()
                .all(|c| c.minimize_data_movement)
        });
    if enabled {
        PreCheckResult::pass(ENABLED)
    } else {
        PreCheckResult::warn(NOT_ENABLED)
    }
}

fn check_rebalance_config(ctx: &PreCheckContext<'_>) -> PreCheckResult {
    let table = ctx.table_config;
    let config = ctx.rebalance_config;
    let mut warnings: Vec<String> = Vec::new();

    if table.is_realtime() && !config.include_consuming {
        warnings.push("includeConsuming is disabled for a realtime table.".to_string());
    }
    if config.best_efforts {
        warnings.push("bestEfforts is enabled, only enable it if you know what you are doing".to_string());
    }
    if config.bootstrap {
        warnings.push(
            "bootstrap is enabled which can cause a large amount of data movement, double check if this is intended"
                .to_string(),
        );
    }
    if !table.tiers.is_empty() && !config.update_target_tier {
        warnings.push("updateTargetTier should be enabled when tier configs are present".to_string());
    }
    if config.downtime && table.replication > 1 {
        warnings.push(format!(
            "Number of replicas ({}) is greater than 1, downtime is not recommended.",
            table.replication
        ));
    }
    if table.pauseless {
        if table.replication == 1 {
            warnings.push(
                "Replication of the table is 1, which is not recommended for pauseless tables as it may cause \
                 data loss during rebalance"
                    .to_string(),
            );
        } else if config.min_available_for(table.replication) == 0 {
            warnings.push(
                "Downtime or minAvailableReplicas=0 for pauseless tables may cause data loss during rebalance"
                    .to_string(),
            );
        }
    }
    let max_added = ctx.summary.segment_info.max_segments_added_to_a_single_server;
    let batching_safe = config
        .batch_size()
        .is_some_and(|b| b as i64 <= RECOMMENDED_BATCH_SIZE as i64);
    if max_added > SEGMENT_ADD_THRESHOLD && !batching_safe {
        warnings.push(format!(
            "Number of segments to add to a single server ({}) is high (>{}). It is recommended to set \
             batchSizePerServer to {} or lower to avoid excessive load on servers.",
            max_added, SEGMENT_ADD_THRESHOLD, RECOMMENDED_BATCH_SIZE
        ));
    }

    if warnings.is_empty() {
        PreCheckResult::pass("All rebalance parameters look good")
    } else {
        PreCheckResult::warn(warnings.join("\n"))
    }
}

fn check_replica_groups(ctx: &PreCheckContext<'_>) -> PreCheckResult {
    let table = ctx.table_config;
    let mut lines: Vec<String> = Vec::new();
    let mut replica_groups_enabled = false;

    for ty in table.instance_partitions_types() {
        let line = match table.instance_assignment_config(ty) {
            Some(config) if config.replica_group_partition.replica_group_based => {
                replica_groups_enabled = true;
                let rg = &config.replica_group_partition;
                let per_group = if rg.num_instances_per_replica_group == 0 {
                    "0 (using as many instances as possible)".to_string()
                } else {
                    rg.num_instances_per_replica_group.to_string()
                };
                format!(
                    "{} segments - numReplicaGroups: {}, numInstancesPerReplicaGroup: {}",
                    ty, rg.num_replica_groups, per_group
                )
            }
            _ => format!(
                "{} segments - Replica Groups are not enabled, replication: {}",
                ty, table.replication
            ),
        };
        lines.push(line);
    }
    for tier in &table.tiers {
        lines.push(format!(
            "{} tier - Replica Groups are not enabled, replication: {}",
            tier.name, table.replication
        ));
    }

    let message = lines.join("\n");
    if replica_groups_enabled && !ctx.rebalance_config.reassign_instances {
        PreCheckResult::warn(format!(
            "reassignInstances is disabled, replica groups may not be updated.\n{}",
            message
        ))
    } else {
        PreCheckResult::pass(message)
    }
}
