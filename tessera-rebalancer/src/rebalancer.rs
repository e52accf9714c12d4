//! Table Rebalancer
//!
//! Drives one table from its current assignment to the target one:
//! 1. Validate options, read ideal state, instances and segment metadata
//! 2. Compute instance partitions (per type and per tier)
//! 3. Compute the target segment assignment and the summary
//! 4. Return early for NO_OP and dry runs
//! 5. Persist instance partitions, then write the target step by step,
//!    waiting for the external view to converge between steps
//!
//! Computation errors end in FAILED before anything is written. Apply errors
//! keep every step already written; calling rebalance again resumes from the
//! partially updated state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tessera_assignment::{
    sort_tiers, AssignOptions, InstanceAssignmentDriver, InstancePartitionsMap, SegmentAssignmentStrategy,
    TierPlacement,
};
use tessera_core::{
    ExternalView, InstanceConfig, InstancePartitions, Result, SegmentAssignment, SegmentMetadata, SegmentState,
    TableConfig, TesseraError,
};

use crate::batch::{next_assignment, reached_target};
use crate::cluster::{ClusterStateStore, SegmentMetadataStore, StreamOffsetSource};
use crate::config::RebalancerConfig;
use crate::job::{ProgressStatus, RebalanceConfig, RebalanceProgress, RebalanceResult, RebalanceStatus};
use crate::metrics;
use crate::precheck::{PreCheckConfig, PreCheckContext, RebalancePreChecker};
use crate::summary::{compute_summary, consuming_summary};
use crate::updater::update_ideal_state;

/// Instance partitions computed for a rebalance, with what must be written
#[derive(Debug, Default)]
struct InstancePartitionsPlan {
    by_type: InstancePartitionsMap,
    by_tier: BTreeMap<String, InstancePartitions>,
    tiers: Vec<TierPlacement>,
    to_persist: Vec<InstancePartitions>,
    to_remove: Vec<String>,
}

impl InstancePartitionsPlan {
    fn changed(&self) -> bool {
        !self.to_persist.is_empty() || !self.to_remove.is_empty()
    }
}

/// Result of checking an external view against an ideal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Converged,
    Pending,
    /// A replica reported ERROR for this segment
    Error(String),
}

/// Whether the external view serves every replica of the ideal state
pub fn external_view_converged(ideal: &SegmentAssignment, external_view: &ExternalView, best_efforts: bool) -> Convergence {
    for (segment, instances) in ideal {
        let observed = external_view.get(segment);
        for (instance, state) in instances {
            if *state == SegmentState::Offline {
                continue;
            }
            match observed.and_then(|m| m.get(instance)) {
                Some(reported) if reported == state => {}
                Some(SegmentState::Error) if best_efforts => {}
                Some(SegmentState::Error) => return Convergence::Error(segment.clone()),
                _ => return Convergence::Pending,
            }
        }
    }
    Convergence::Converged
}

/// Rebalances tables against injected cluster collaborators
pub struct TableRebalancer {
    store: Arc<dyn ClusterStateStore>,
    metadata: Arc<dyn SegmentMetadataStore>,
    config: RebalancerConfig,
    pre_checker: Option<RebalancePreChecker>,
    stream_offsets: Option<Arc<dyn StreamOffsetSource>>,
    progress_tx: Option<mpsc::Sender<RebalanceProgress>>,
    now_ms: Option<i64>,
}

impl TableRebalancer {
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        metadata: Arc<dyn SegmentMetadataStore>,
        config: RebalancerConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            config,
            pre_checker: None,
            stream_offsets: None,
            progress_tx: None,
            now_ms: None,
        }
    }

    pub fn with_pre_checker(mut self, pre_checker: RebalancePreChecker) -> Self {
        self.pre_checker = Some(pre_checker);
        self
    }

    pub fn with_stream_offsets(mut self, source: Arc<dyn StreamOffsetSource>) -> Self {
        self.stream_offsets = Some(source);
        self
    }

    /// Create a rebalancer that publishes progress updates
    pub fn with_progress(mut self) -> (Self, mpsc::Receiver<RebalanceProgress>) {
        let (tx, rx) = mpsc::channel(100);
        self.progress_tx = Some(tx);
        (self, rx)
    }

    /// Fix the wall clock used for time tiers and segment ages
    pub fn with_now(mut self, now_ms: i64) -> Self {
        self.now_ms = Some(now_ms);
        self
    }

    fn now_ms(&self) -> i64 {
        self.now_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }

    /// Rebalance a table.
    ///
    /// Only an invalid `RebalanceConfig` is returned as an error; every other
    /// failure is reported through the result status.
    pub async fn rebalance(
        &self,
        table_config: &TableConfig,
        config: &RebalanceConfig,
        job_id: Option<String>,
    ) -> Result<RebalanceResult> {
        self.rebalance_with_cancel(table_config, config, job_id, &CancellationToken::new())
            .await
    }

    /// Rebalance a table, checking `cancel` before every step
    #[instrument(skip_all, fields(table = %table_config.table_name, job_id = tracing::field::Empty))]
    pub async fn rebalance_with_cancel(
        &self,
        table_config: &TableConfig,
        config: &RebalanceConfig,
        job_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RebalanceResult> {
        config.validate()?;

        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("job_id", job_id.as_str());
        let start = Instant::now();
        info!(dry_run = config.dry_run, downtime = config.downtime, "Starting rebalance");

        let result = self.run(table_config, config, &job_id, cancel).await;

        metrics::record_result(&table_config.table_name, result.status, start.elapsed());
        self.report(&job_id, 0, 0, ProgressStatus::Completed(result.status))
            .await;
        match result.status {
            RebalanceStatus::Failed => error!(elapsed = ?start.elapsed(), "{}", result.summary()),
            _ => info!(elapsed = ?start.elapsed(), "{}", result.summary()),
        }
        Ok(result)
    }

    async fn run(
        &self,
        table_config: &TableConfig,
        config: &RebalanceConfig,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> RebalanceResult {
        let table = table_config.table_name.as_str();
        let failed = |description: String| RebalanceResult::bare(job_id, RebalanceStatus::Failed, description);

        if config.pre_checks && !config.dry_run {
            return failed("Pre-checks can only be enabled in dry-run mode, not triggering rebalance".to_string());
        }
        if let Err(e) = table_config.validate() {
            return failed(format!("Invalid table config: {}", e));
        }

        let current = match self.store.get_ideal_state(table).await {
            Ok(Some(current)) => current,
            Ok(None) => return failed(format!("Cannot find the ideal state for table: {}", table)),
            Err(e) => return failed(format!("Caught exception while fetching ideal state: {}", e)),
        };
        let instances = match self.store.get_instance_configs().await {
            Ok(instances) => instances,
            Err(e) => return failed(format!("Caught exception while fetching instance configs: {}", e)),
        };
        let segments: BTreeMap<String, SegmentMetadata> = match self.metadata.get_segment_metadata(table).await {
            Ok(segments) => segments.into_iter().map(|m| (m.name.clone(), m)).collect(),
            Err(e) => return failed(format!("Caught exception while fetching segment metadata: {}", e)),
        };

        let plan = match self.plan_instance_partitions(table_config, config, &instances).await {
            Ok(plan) => plan,
            Err(e) => {
                return failed(format!("Caught exception while calculating instance partitions: {}", e));
            }
        };

        let now_ms = self.now_ms();
        let strategy = SegmentAssignmentStrategy::for_table(table_config);
        let options = AssignOptions {
            include_consuming: config.include_consuming,
            bootstrap: config.bootstrap,
            now_ms,
        };
        let target = match strategy.assign(&segments, &plan.by_type, &plan.tiers, &current.assignment, options) {
            Ok(target) => target,
            Err(e) => return failed(format!("Caught exception while calculating target assignment: {}", e)),
        };

        let mut summary = compute_summary(table_config, &current.assignment, &target.assignment, &instances, &segments);
        if table_config.is_realtime() {
            summary.segment_info.consuming_segment_to_be_moved_summary = Some(
                consuming_summary(
                    table,
                    &current.assignment,
                    &target.assignment,
                    &segments,
                    self.stream_offsets.as_deref(),
                    self.config.pre_check_timeout(),
                    now_ms,
                )
                .await,
            );
        }

        let pre_checks = if config.pre_checks {
            let ctx = PreCheckContext {
                table_config,
                rebalance_config: config,
                current: &current.assignment,
                target: &target.assignment,
                summary: &summary,
            };
            Some(match &self.pre_checker {
                Some(checker) => checker.check(&ctx).await,
                None => {
                    RebalancePreChecker::new(PreCheckConfig::from(&self.config))
                        .check(&ctx)
                        .await
                }
            })
        } else {
            None
        };

        let segments_unchanged = target.assignment == current.assignment;
        let instance_partitions_changed = plan.changed();
        let mut result = RebalanceResult {
            job_id: job_id.to_string(),
            status: RebalanceStatus::Done,
            description: String::new(),
            instance_assignment: Some(plan.by_type.clone()),
            tier_instance_assignment: Some(plan.by_tier.clone()),
            segment_assignment: Some(target.assignment.clone()),
            rebalance_summary_result: Some(summary),
            pre_checks_result: pre_checks,
        };

        if segments_unchanged && !instance_partitions_changed {
            result.status = RebalanceStatus::NoOp;
            result.description = "Table is already balanced".to_string();
            return result;
        }
        if config.dry_run {
            result.description = "Dry-run mode".to_string();
            return result;
        }

        let replication = target
            .assignment
            .values()
            .map(|m| m.len())
            .max()
            .unwrap_or(table_config.replication);
        let min_available = config.min_available_for(replication);
        if !config.downtime && min_available >= replication {
            result.status = RebalanceStatus::Failed;
            result.description = format!(
                "Illegal config for minAvailableReplicas: {} for table: {}, must be less than number of replicas: {}",
                min_available, table, replication
            );
            return result;
        }

        for partitions in &plan.to_persist {
            if let Err(e) = self.store.put_instance_partitions(partitions).await {
                result.status = RebalanceStatus::Failed;
                result.description = format!("Caught exception while persisting instance partitions: {}", e);
                return result;
            }
            info!(name = %partitions.name(), "Persisted instance partitions");
        }
        for name in &plan.to_remove {
            if let Err(e) = self.store.remove_instance_partitions(name).await {
                result.status = RebalanceStatus::Failed;
                result.description = format!("Caught exception while removing instance partitions: {}", e);
                return result;
            }
            info!(name = %name, "Removed instance partitions");
        }

        if config.update_target_tier {
            let tiers: BTreeMap<String, Option<String>> = segments
                .keys()
                .map(|segment| (segment.clone(), target.segment_tiers.get(segment).cloned()))
                .collect();
            if let Err(e) = self.metadata.set_target_tiers(table, &tiers).await {
                warn!(error = %e, "Failed to update target tiers");
            }
        }

        if segments_unchanged {
            result.description = "Instance partitions updated, segment assignment unchanged".to_string();
            return result;
        }

        match self
            .apply(table, config, &current.assignment, &target.assignment, min_available, job_id, cancel)
            .await
        {
            Ok(ApplyOutcome::Done { steps }) => {
                result.description = format!("Success with {} steps", steps);
            }
            Ok(ApplyOutcome::Cancelled { steps }) => {
                result.status = RebalanceStatus::Cancelled;
                result.description = format!("Rebalance cancelled after {} steps", steps);
            }
            Err(description) => {
                result.status = RebalanceStatus::Failed;
                result.description = description;
            }
        }
        result
    }

    /// Write the target in steps
    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        table: &str,
        config: &RebalanceConfig,
        current: &SegmentAssignment,
        target: &SegmentAssignment,
        min_available: usize,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<ApplyOutcome, String> {
        let batch_size = config.batch_size();
        let check_interval = config
            .external_view_check_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.external_view_check_interval());
        let stabilization_timeout = config
            .external_view_stabilization_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.external_view_stabilization_timeout());

        let mut previous = current.clone();
        let mut steps = 0usize;
        loop {
            if cancel.is_cancelled() {
                warn!(steps, "Rebalance cancelled");
                return Ok(ApplyOutcome::Cancelled { steps });
            }

            let update = update_ideal_state(
                self.store.as_ref(),
                table,
                |current: &SegmentAssignment| {
                    (!reached_target(current, target))
                        .then(|| next_assignment(current, target, min_available, batch_size))
                },
                &self.config.ideal_state_retry,
                true,
            )
            .await
            .map_err(|e| match e {
                TesseraError::TableNotFound(_) => format!("Table {} was deleted during rebalance", table),
                e => format!("Caught exception while updating ideal state: {}", e),
            })?;

            let written = update.ideal_state.assignment;
            if !update.updated {
                if reached_target(&written, target) {
                    return Ok(ApplyOutcome::Done { steps });
                }
                return Err(format!("Rebalance of {} made no progress", table));
            }

            steps += 1;
            let segments_updated = written
                .iter()
                .filter(|(segment, instances)| previous.get(*segment) != Some(*instances))
                .count();
            metrics::record_step(table, segments_updated);
            debug!(step = steps, segments_updated, version = update.ideal_state.version, "Wrote rebalance step");
            self.report(job_id, steps, segments_updated, ProgressStatus::Running)
                .await;

            if !config.downtime {
                self.wait_for_external_view(table, &written, config.best_efforts, check_interval, stabilization_timeout)
                    .await?;
                self.report(job_id, steps, segments_updated, ProgressStatus::Converged)
                    .await;
            }

            if reached_target(&written, target) {
                return Ok(ApplyOutcome::Done { steps });
            }
            previous = written;
        }
    }

    async fn wait_for_external_view(
        &self,
        table: &str,
        ideal: &SegmentAssignment,
        best_efforts: bool,
        check_interval: Duration,
        timeout: Duration,
    ) -> std::result::Result<(), String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.store.get_external_view(table).await {
                Ok(Some(external_view)) => match external_view_converged(ideal, &external_view, best_efforts) {
                    Convergence::Converged => return Ok(()),
                    Convergence::Error(segment) => {
                        return Err(format!("Found segment {} in ERROR state for table: {}", segment, table));
                    }
                    Convergence::Pending => {}
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to fetch external view"),
            }

            if tokio::time::Instant::now() >= deadline {
                if best_efforts {
                    warn!(timeout = ?timeout, "External view did not converge, continuing with best efforts");
                    return Ok(());
                }
                return Err(format!(
                    "Timed out waiting for external view to converge for table: {}",
                    table
                ));
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Instance partitions for every segment type and tier
    async fn plan_instance_partitions(
        &self,
        table_config: &TableConfig,
        config: &RebalanceConfig,
        instances: &[InstanceConfig],
    ) -> Result<InstancePartitionsPlan> {
        let table = &table_config.table_name;
        let driver = InstanceAssignmentDriver::new(table_config);
        let minimize = config.minimize_data_movement.resolve();
        let mut plan = InstancePartitionsPlan::default();

        for ty in table_config.instance_partitions_types() {
            let name = ty.instance_partitions_name(table);
            let existing = self
                .store
                .get_instance_partitions(&name)
                .await
                .map_err(TesseraError::cluster)?;
            if let Some(existing) = &existing {
                existing.validate()?;
            }
            let has_config = table_config.instance_assignment_config(ty).is_some();

            let partitions = match (config.reassign_instances, has_config, existing) {
                (true, true, existing) => {
                    let partitions = driver.assign(ty, instances, existing.as_ref(), minimize)?;
                    if existing.as_ref() != Some(&partitions) {
                        plan.to_persist.push(partitions.clone());
                    }
                    partitions
                }
                (true, false, existing) => {
                    if existing.is_some() {
                        plan.to_remove.push(name.clone());
                    }
                    driver.assign(ty, instances, None, Some(false))?
                }
                (false, _, Some(existing)) => existing,
                (false, _, None) => driver.assign(ty, instances, None, minimize)?,
            };
            debug!(ty = %ty, name = %name, "Resolved instance partitions");
            plan.by_type.insert(ty, partitions);
        }

        for tier in sort_tiers(&table_config.tiers)? {
            let name = tier.config.instance_partitions_name(table);
            let existing = self
                .store
                .get_instance_partitions(&name)
                .await
                .map_err(TesseraError::cluster)?;
            if let Some(existing) = &existing {
                existing.validate()?;
            }
            let partitions = match existing {
                Some(existing) if !config.reassign_instances => existing,
                existing => {
                    let partitions = driver.assign_tier(
                        &tier.config,
                        instances,
                        existing.as_ref(),
                        minimize.unwrap_or(false),
                    )?;
                    if config.reassign_instances && existing.as_ref() != Some(&partitions) {
                        plan.to_persist.push(partitions.clone());
                    }
                    partitions
                }
            };
            plan.by_tier
                .insert(tier.name().to_string(), partitions.clone());
            plan.tiers.push(TierPlacement {
                tier,
                instance_partitions: partitions,
            });
        }
        Ok(plan)
    }

    async fn report(&self, job_id: &str, step: usize, segments_updated: usize, status: ProgressStatus) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx
                .send(RebalanceProgress {
                    job_id: job_id.to_string(),
                    step,
                    segments_updated,
                    status,
                })
                .await;
        }
    }
}

enum ApplyOutcome {
    Done { steps: usize },
    Cancelled { steps: usize },
}
