//! Tessera Rebalancer CLI
//!
//! Rebalances one table of a cluster snapshot:
//! - Loads the snapshot (JSON) and the table's config from it
//! - Runs the rebalance with the options given on the command line
//! - Prints the result as JSON and writes the snapshot back after a
//!   successful non-dry run

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tessera_rebalancer::{
    metrics, Enablement, InMemoryCluster, PreCheckConfig, ProgressStatus, RebalanceConfig,
    RebalancePreChecker, RebalanceStatus, RebalancerConfig, TableRebalancer,
    DISABLE_BATCH_SIZE_PER_SERVER,
};

#[derive(Parser)]
#[command(name = "tessera-rebalancer")]
#[command(about = "Rebalance the segments of a Tessera table")]
struct Cli {
    /// Cluster snapshot file (JSON)
    #[arg(long, env = "TESSERA_CLUSTER")]
    cluster: PathBuf,

    /// Table name with type suffix, e.g. events_OFFLINE
    #[arg(long)]
    table: String,

    /// Rebalancer service config (TOML); environment variables otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Compute and report without writing
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Run pre-checks (dry run only)
    #[arg(long, default_value = "false")]
    pre_checks: bool,

    /// Recompute instance partitions
    #[arg(long, default_value = "false")]
    reassign_instances: bool,

    /// Move consuming segments too
    #[arg(long, default_value = "false")]
    include_consuming: bool,

    /// Ignore the current assignment
    #[arg(long, default_value = "false")]
    bootstrap: bool,

    /// Write the target in one step
    #[arg(long, default_value = "false")]
    downtime: bool,

    /// Replicas kept available per segment, negative for replication minus value
    #[arg(long, default_value = "1", allow_negative_numbers = true)]
    min_available_replicas: i32,

    /// Segments added per server per step, -1 to disable batching
    #[arg(long, default_value_t = DISABLE_BATCH_SIZE_PER_SERVER, allow_negative_numbers = true)]
    batch_size_per_server: i32,

    /// Continue past external view timeouts and ERROR replicas
    #[arg(long, default_value = "false")]
    best_efforts: bool,

    /// Override the table's minimizeDataMovement flag
    #[arg(long, value_enum, default_value = "default")]
    minimize_data_movement: Enablement,

    /// Record each segment's tier in its metadata
    #[arg(long, default_value = "false")]
    update_target_tier: bool,

    /// Job id, generated when absent
    #[arg(long)]
    job_id: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log as JSON
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Cli {
    fn rebalance_config(&self) -> RebalanceConfig {
        RebalanceConfig {
            dry_run: self.dry_run,
            pre_checks: self.pre_checks,
            reassign_instances: self.reassign_instances,
            include_consuming: self.include_consuming,
            bootstrap: self.bootstrap,
            downtime: self.downtime,
            min_available_replicas: self.min_available_replicas,
            batch_size_per_server: self.batch_size_per_server,
            best_efforts: self.best_efforts,
            minimize_data_movement: self.minimize_data_movement,
            update_target_tier: self.update_target_tier,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    let service_config = match &cli.config {
        Some(path) => RebalancerConfig::from_file(path)?,
        None => RebalancerConfig::from_env()?,
    };

    if let Some(port) = cli.metrics_port {
        metrics::install_exporter(port).map_err(|e| anyhow::anyhow!("Metrics exporter failed: {}", e))?;
    }

    info!(cluster = %cli.cluster.display(), table = %cli.table, "Loading cluster snapshot");
    let cluster = Arc::new(InMemoryCluster::load(&cli.cluster)?);
    let table_config = cluster
        .table_config(&cli.table)
        .ok_or_else(|| anyhow::anyhow!("Table not found: {}", cli.table))?;

    let pre_checker = RebalancePreChecker::new(PreCheckConfig::from(&service_config))
        .with_reload_probe(cluster.clone())
        .with_disk_usage(cluster.clone());
    let (rebalancer, mut progress_rx) = TableRebalancer::new(cluster.clone(), cluster.clone(), service_config)
        .with_pre_checker(pre_checker)
        .with_stream_offsets(cluster.clone())
        .with_progress();

    tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            match update.status {
                ProgressStatus::Running => info!(
                    job_id = %update.job_id,
                    step = update.step,
                    segments_updated = update.segments_updated,
                    "Step written"
                ),
                ProgressStatus::Converged => info!(job_id = %update.job_id, step = update.step, "Step converged"),
                ProgressStatus::Completed(status) => info!(job_id = %update.job_id, status = %status, "Job finished"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, cancelling after the current step");
            ctrl_c.cancel();
        }
    });

    let config = cli.rebalance_config();
    let result = rebalancer
        .rebalance_with_cancel(&table_config, &config, cli.job_id.clone(), &cancel)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    // Partial steps are persisted too, so a later run resumes from them
    if !config.dry_run && result.status != RebalanceStatus::NoOp {
        cluster.save(&cli.cluster)?;
        info!(cluster = %cli.cluster.display(), "Saved cluster snapshot");
    }

    if result.status == RebalanceStatus::Failed {
        error!(description = %result.description, "Rebalance failed");
        std::process::exit(1);
    }
    Ok(())
}
