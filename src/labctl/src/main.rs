//! labctl: bring a tiered lab cluster up, down or report on it.

use clap::{Parser, Subcommand};
use deploy::{
    cluster_status, teardown, Backends, ChannelProgressReporter, DeploymentOutcome, LabConfig,
    PrefetchOutcome, ProgressMessage, StepState, TeardownMode, Tier, TierOrchestrator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "labctl", version, about = "Tiered lab cluster deployment")]
struct Args {
    /// Config file (default: ./labctl.toml, then the user config dir)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy tiers 0 through --tier
    Start {
        /// 0 cluster base, 1 infrastructure, 2 platform, 3 application
        #[arg(short = 't', long = "tier", default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=3))]
        tier: u8,

        /// Exit without waiting for the background model prefetch
        #[arg(long = "no-wait-prefetch")]
        no_wait_prefetch: bool,
    },
    /// Stop the cluster and host services
    Stop,
    /// Delete the cluster and remove host services
    Delete,
    /// Show cluster and node state
    Status,
}

/// Print progress events as they arrive.
async fn display_progress(mut rx: mpsc::UnboundedReceiver<ProgressMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            ProgressMessage::Step(event) => {
                let prefix = format!(
                    "  [{}/{}] {}",
                    event.step_index + 1,
                    event.total_steps,
                    event.step_name
                );
                match event.state {
                    StepState::Started => eprintln!("{} ...", prefix),
                    StepState::Completed => eprintln!("{} done", prefix),
                    StepState::Failed(error) => eprintln!("{} FAILED: {}", prefix, error),
                }
            }
            ProgressMessage::Finished(phase) => eprintln!("✓ {} complete", phase),
        }
    }
}

fn print_outcome(outcome: &DeploymentOutcome) {
    eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for tier in &outcome.completed_tiers {
        eprintln!("  {} ready", tier);
    }
    eprintln!(
        "  Workload node: {}",
        outcome.elected_node.as_deref().unwrap_or("none")
    );
    if let Some(credentials) = &outcome.credentials {
        eprintln!("  IAM admin user: {}", credentials.iam_admin_user);
        eprintln!("  Application client: {}", credentials.app_client_id);
    }
    eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

async fn start(
    config: LabConfig,
    tier: Tier,
    wait_prefetch: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let display = tokio::spawn(display_progress(progress_rx));

    let backends = Backends::subprocess(&config);
    let reporter = Arc::new(ChannelProgressReporter::new(progress_tx));
    let orchestrator = TierOrchestrator::new(config, backends, reporter, cancel)?;

    info!("Deploying up to {}", tier);
    let result = orchestrator.run(tier).await;
    drop(orchestrator);
    let _ = display.await;

    let outcome = result?;
    print_outcome(&outcome);

    if let Some(handle) = outcome.prefetch {
        if wait_prefetch {
            eprintln!("  Waiting for model prefetch (Ctrl+C to skip)...");
            match handle.wait().await {
                PrefetchOutcome::Completed { node, artifact } => {
                    eprintln!("  Prefetched {} on {}", artifact, node)
                }
                other => eprintln!("  Prefetch did not complete: {:?}", other),
            }
        } else {
            eprintln!("  Model prefetch abandoned, the workload pulls on demand");
        }
    }
    Ok(())
}

async fn run(args: Args, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = LabConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Start {
            tier,
            no_wait_prefetch,
        } => start(config, Tier::from_index(tier)?, !no_wait_prefetch, cancel).await,
        Command::Stop => {
            let backends = Backends::subprocess(&config);
            teardown(backends.lifecycle.as_ref(), &config, TeardownMode::Stop).await?;
            eprintln!("Cluster {} stopped", config.cluster.name);
            Ok(())
        }
        Command::Delete => {
            let backends = Backends::subprocess(&config);
            teardown(backends.lifecycle.as_ref(), &config, TeardownMode::Delete).await?;
            eprintln!("Cluster {} deleted", config.cluster.name);
            Ok(())
        }
        Command::Status => {
            let backends = Backends::subprocess(&config);
            let status = cluster_status(&backends).await?;
            eprintln!(
                "Cluster {}: {}",
                config.cluster.name,
                if status.running { "running" } else { "stopped" }
            );
            for node in &status.nodes {
                eprintln!(
                    "  {} accelerator={}",
                    node.name,
                    node.label(deploy::nodes::ACCELERATOR_LABEL).unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

fn main() {
    // Default to info level if RUST_LOG not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async {
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, cancelling");
                signal_cancel.cancel();
            }
        });
        run(args, cancel).await
    });

    if let Err(e) = result {
        tracing::error!("labctl failed: {}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
