//! Shardplan Scheduler
//!
//! Loads a cluster snapshot, runs every checker over every region and logs
//! the operators it would dispatch. Rules come from a sled store, or stay
//! in memory for dry runs.

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use shardplan_placement::RuleManager;
use shardplan_scheduler::metrics::init_metrics;
use shardplan_scheduler::{CheckerController, ClusterSnapshot, LogFormat, MemoryCluster, SchedulerConfig};
use shardplan_storage::{MemoryRuleStorage, RuleStorage, SledRuleStorage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardplan-scheduler")]
#[command(about = "Check a cluster snapshot and print the operators that would fix it")]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "SHARDPLAN_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster snapshot (JSON)
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Sled directory holding placement rules
    #[arg(long)]
    rule_storage: Option<PathBuf>,

    /// Regions checked concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Don't persist rules from the snapshot
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

fn init_tracing(config: &SchedulerConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Rule store backing the rule manager
///
/// Dry runs copy the persisted rules into memory so snapshot rules never
/// reach disk.
fn open_rule_storage(path: Option<&Path>, dry_run: bool) -> anyhow::Result<Arc<dyn RuleStorage>> {
    let path = match path {
        Some(path) => path,
        None => return Ok(Arc::new(MemoryRuleStorage::new())),
    };
    let sled = SledRuleStorage::open(path).with_context(|| format!("open rule storage {}", path.display()))?;
    if !dry_run {
        return Ok(Arc::new(sled));
    }

    let memory = MemoryRuleStorage::new();
    for (key, value) in sled.load_rules()? {
        memory.insert_raw(key, value);
    }
    Ok(Arc::new(memory))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path).with_context(|| format!("load config {}", path.display()))?,
        None => SchedulerConfig::default(),
    }
    .with_env_overrides()
    .with_overrides(cli.snapshot, cli.rule_storage, cli.workers, cli.dry_run);
    config.validate()?;

    init_tracing(&config);
    init_metrics();

    info!(
        snapshot = %config.snapshot_path.display(),
        workers = config.workers,
        dry_run = config.dry_run,
        "Starting shardplan scheduler"
    );

    let data = std::fs::read_to_string(&config.snapshot_path)
        .with_context(|| format!("read snapshot {}", config.snapshot_path.display()))?;
    let snapshot = ClusterSnapshot::from_json(&data)?;

    let storage = open_rule_storage(config.rule_storage_path.as_deref(), config.dry_run)?;
    let rule_manager = Arc::new(RuleManager::new(storage));
    let cluster = Arc::new(MemoryCluster::from_snapshot(snapshot, rule_manager)?);
    let controller = Arc::new(CheckerController::new(cluster.clone()).skip_merge_warm_up());

    let regions = cluster.regions();
    info!(regions = regions.len(), "Cluster snapshot loaded");

    let permits = Arc::new(Semaphore::new(config.workers));
    let tasks = regions.into_iter().map(|region| {
        let controller = controller.clone();
        let permits = permits.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let ops = tokio::task::spawn_blocking(move || controller.check_region(&region)).await?;
            anyhow::Ok(ops.unwrap_or_default())
        })
    });

    let mut total = 0usize;
    for result in join_all(tasks).await {
        match result {
            Ok(Ok(ops)) => {
                for op in ops {
                    info!(region_id = op.region_id(), operator = %op, "Operator created");
                    total += 1;
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Region check failed"),
            Err(e) => error!(error = %e, "Region check task panicked"),
        }
    }

    info!(operators = total, "Scheduling pass complete");
    Ok(())
}
