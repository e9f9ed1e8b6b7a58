//! Tessel Rebuild
//!
//! Runs the rebuild engine against an in-process simulated cluster:
//! writes a data set, applies a target state change and waits for the
//! resulting rebuild to finish.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;
use tessel_rebuild::sim::SimCluster;
use tessel_rebuild::{ClusterMap, RebuildConfig, RebuildState};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tessel-rebuild")]
#[command(about = "Tessel pool rebuild engine")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rebuild on a simulated cluster
    Simulate {
        /// Number of engines, one target each
        #[arg(long, default_value = "4")]
        ranks: u32,

        /// Replicas per object
        #[arg(long, default_value = "2")]
        replicas: usize,

        /// Objects written before the change
        #[arg(long, default_value = "200")]
        objects: usize,

        /// Value size in bytes
        #[arg(long, default_value = "4096")]
        value_size: usize,

        /// Operation to apply
        #[arg(long, value_enum, default_value = "exclude")]
        op: SimOp,

        /// Target the operation acts on
        #[arg(long, default_value = "1")]
        target: u32,

        /// Give up after this many seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum SimOp {
    Exclude,
    Drain,
    /// Exclude the target, then bring it back
    Reintegrate,
    /// Add a new engine and fill it
    Extend,
    Upgrade,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = RebuildConfig::from_env().context("invalid rebuild configuration")?;
    config.validate().context("invalid rebuild configuration")?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Simulate {
            ranks,
            replicas,
            objects,
            value_size,
            op,
            target,
            timeout,
        } => {
            if target >= ranks {
                bail!("target {target} out of range for {ranks} ranks");
            }
            if replicas == 0 || replicas > ranks as usize {
                bail!("replicas must be between 1 and {ranks}");
            }
            simulate(
                config,
                ranks,
                replicas,
                objects,
                value_size,
                op,
                target,
                Duration::from_secs(timeout),
            )
            .await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[allow(clippy::too_many_arguments)]
async fn simulate(
    config: RebuildConfig,
    ranks: u32,
    replicas: usize,
    objects: usize,
    value_size: usize,
    op: SimOp,
    target: u32,
    timeout: Duration,
) -> Result<()> {
    let cluster = SimCluster::start(ranks, replicas, config);
    let pool = cluster.pool;
    info!(ranks, replicas, objects, %pool, "Simulated cluster started");

    let value = Bytes::from(vec![0xA5u8; value_size]);
    let mut oids = Vec::with_capacity(objects);
    for i in 0..objects {
        oids.push(cluster.write(&format!("obj-{i}"), b"dkey", b"akey", value.clone())?);
    }

    let admin = cluster.admin();
    match op {
        SimOp::Exclude => {
            admin.exclude(pool, &[target])?;
        }
        SimOp::Drain => {
            admin.drain(pool, &[target])?;
        }
        SimOp::Reintegrate => {
            admin.exclude(pool, &[target])?;
            cluster.wait_settled(timeout).await?;
            admin.reintegrate(pool, &[target])?;
        }
        SimOp::Extend => {
            let (rank, _) = cluster.add_rank();
            admin.extend(pool, &[rank])?;
        }
        SimOp::Upgrade => {
            let layout = cluster.map.layout_version(pool)? + 1;
            admin.upgrade(pool, layout)?;
        }
    }

    let status = cluster.wait_settled(timeout).await?;
    let under_replicated = oids
        .iter()
        .filter(|&&oid| cluster.replica_count(oid) < replicas)
        .count();

    println!("{}", serde_json::to_string_pretty(&status)?);
    cluster.shutdown().await;

    if status.state != RebuildState::Completed || status.error.is_some() {
        bail!("rebuild did not complete cleanly: {:?}", status.error);
    }
    if under_replicated > 0 {
        warn!(under_replicated, "Objects below target redundancy");
        bail!("{under_replicated} objects under-replicated");
    }
    info!(objects, "All objects at full redundancy");
    Ok(())
}
