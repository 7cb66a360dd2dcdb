use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kiln_core::JobCommand;
use kiln_master::{JOB_COMMAND_PREFIX, MasterConfig};
use kiln_worker::WorkerConfig;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Distributed firmware build farm")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master that dispatches builds to workers.
    Master(ConfigArgs),
    /// Run a build worker.
    Worker(ConfigArgs),
    /// Validate a master config and print its job commands.
    Check(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Master(args) => run_master_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Check(args) => run_check_command(args),
    }
}

async fn run_master_command(args: ConfigArgs) -> Result<()> {
    let config = MasterConfig::load(&args.config)
        .with_context(|| format!("failed to load master config {}", args.config.display()))?;
    let shutdown = shutdown_on_ctrl_c();
    kiln_master::run(config, shutdown)
        .await
        .context("master stopped with an error")
}

async fn run_worker_command(args: ConfigArgs) -> Result<()> {
    let config = WorkerConfig::load(&args.config)
        .with_context(|| format!("failed to load worker config {}", args.config.display()))?;
    info!(ident = %config.name, master = %config.master_address, "starting worker");
    let shutdown = shutdown_on_ctrl_c();
    kiln_worker::run(config, shutdown)
        .await
        .context("worker stopped with an error")
}

fn run_check_command(args: ConfigArgs) -> Result<()> {
    let config = MasterConfig::load(&args.config)
        .with_context(|| format!("invalid master config {}", args.config.display()))?;
    let addr = config.listen_addr().context("invalid listen address")?;

    println!("listen   {addr}");
    println!("results  {}", config.result_dir.display());
    println!("logs     {}", config.log_dir.display());
    println!("storage  {}", config.storage_root().display());

    let catalog = &config.catalog;
    if catalog.is_empty() {
        println!("no job commands configured");
        return Ok(());
    }
    if let Some(build) = &catalog.build {
        println!("{}", describe("Build", &JobCommand::Single(build.clone())));
    }
    if let Some(set) = &catalog.build_set {
        println!("{}", describe("BuildSet", &JobCommand::Set(set.clone())));
    }
    for (id, command) in &catalog.commands {
        println!("{}", describe(&format!("{JOB_COMMAND_PREFIX}{id}"), command));
    }
    Ok(())
}

fn describe(name: &str, command: &JobCommand) -> String {
    match command {
        JobCommand::Single(build) => {
            format!("{name}: {} command(s) -> {}", build.cmd.len(), build.output)
        }
        JobCommand::Set(set) => {
            let builds: Vec<&str> = set.builds.keys().map(String::as_str).collect();
            let posts: Vec<&str> = set.posts.keys().map(String::as_str).collect();
            format!(
                "{name}: builds [{}], posts [{}] -> {}",
                builds.join(", "),
                posts.join(", "),
                set.merge.output
            )
        }
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(error) => warn!(error = %error, "cannot listen for interrupt, shutting down"),
        }
        trigger.cancel();
    });
    shutdown
}
