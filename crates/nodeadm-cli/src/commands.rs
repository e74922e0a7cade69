use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use nodeadm_agent::{AgentSettings, HostOrchestrator, NodeAgent, OrchestratorSettings, TickOutcome};
use nodeadm_core::config::NodeAdminConfig;
use nodeadm_core::observability::logging::{self, LogFormat};
use nodeadm_runtime::storage::StorageMaintainer;

use crate::wiring;

#[derive(Parser)]
#[command(
    name = "nodeadm",
    version,
    about = "Per-host node administrator: keeps containers in line with the node repository"
)]
struct Cli {
    /// Config file (default: $NODEADM_CONFIG or /etc/nodeadm/nodeadm.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log format: human or json (default: json for `run`, human otherwise)
    #[arg(long, global = true, value_parser = ["human", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host orchestrator until interrupted.
    ///
    /// SIGUSR1 suspends every node agent at its next safe point; SIGUSR2
    /// resumes them.
    Run,
    /// Converge a single node once and print what was done
    Converge {
        /// Hostname of the node to converge
        hostname: String,
        /// Keep ticking until nothing is left to do, up to this many ticks
        #[arg(long, default_value = "1")]
        max_ticks: usize,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// Manage archived node storage
    Archive {
        #[command(subcommand)]
        action: ArchiveCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Parse and validate the config file, then print the effective values
    Check,
}

#[derive(Subcommand)]
enum ArchiveCmd {
    /// Delete archives older than the configured retention
    Cleanup,
}

// ============================================================================
// Command dispatch
// ============================================================================

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_format = match cli.log_format.as_deref() {
        Some(format) => format.parse()?,
        None => match &cli.command {
            Commands::Run => LogFormat::Json,
            _ => LogFormat::Human,
        },
    };
    logging::init(log_format);

    match cli.command {
        Commands::Run => cmd_run(cli.config),
        Commands::Converge {
            hostname,
            max_ticks,
            json,
        } => cmd_converge(cli.config, &hostname, max_ticks, json),
        Commands::Config { action } => match action {
            ConfigCmd::Check => cmd_config_check(cli.config),
        },
        Commands::Archive { action } => match action {
            ArchiveCmd::Cleanup => cmd_archive_cleanup(cli.config),
        },
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn cmd_run(config_path: Option<PathBuf>) -> Result<()> {
    let config = wiring::load_config(config_path.as_deref())?;
    let caps = wiring::capabilities(&config)?;
    let orchestrator = Arc::new(HostOrchestrator::new(
        OrchestratorSettings::from_config(&config),
        caps,
    ));

    wiring::block_on(async move {
        let signals = wiring::watch_maintenance_signals(Arc::clone(&orchestrator))?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(stop_rx).await })
        };

        tokio::signal::ctrl_c()
            .await
            .with_context(|| "Failed to listen for ctrl-c")?;
        info!("Shutdown signal received, stopping node agents...");

        let status = orchestrator.status().await;
        info!(
            agents = status.len(),
            status = %serde_json::to_string(&status)?,
            "Final agent status"
        );
        signals.abort();
        stop_tx.send_replace(true);
        runner
            .await
            .with_context(|| "Host orchestrator task failed")?;
        info!("nodeadm stopped");
        Ok(())
    })
}

fn cmd_converge(
    config_path: Option<PathBuf>,
    hostname: &str,
    max_ticks: usize,
    json: bool,
) -> Result<()> {
    let config = wiring::load_config(config_path.as_deref())?;
    let caps = wiring::capabilities(&config)?;
    let settings = AgentSettings::from_config(&config);

    let (outcomes, usage) = wiring::block_on(async move {
        wiring::seed_reservations(&caps, &config.host.hostname, hostname).await?;
        let (_suspend_tx, suspend_rx) = watch::channel(false);
        let mut agent = NodeAgent::new(hostname, caps, settings, suspend_rx)?;

        let mut outcomes = Vec::new();
        for _ in 0..max_ticks.max(1) {
            agent.invalidate();
            let outcome = agent
                .tick()
                .await
                .with_context(|| format!("Convergence of {} failed", hostname))?;
            let done = outcome == (TickOutcome::Converged { actions: vec![] });
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        let usage = agent.storage_usage().await.ok();
        Ok((outcomes, usage))
    })?;

    if json {
        let ticks: Vec<String> = outcomes.iter().map(TickOutcome::to_string).collect();
        let report = serde_json::json!({
            "hostname": hostname,
            "ticks": ticks,
            "liveStorageBytes": usage,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (i, outcome) in outcomes.iter().enumerate() {
            println!("{} tick {}: {}", hostname, i + 1, outcome);
        }
        if let Some(bytes) = usage {
            println!("{} live storage: {} bytes", hostname, bytes);
        }
    }
    Ok(())
}

fn cmd_config_check(config_path: Option<PathBuf>) -> Result<()> {
    let config = wiring::load_config(config_path.as_deref())?;
    print_config(&config);
    Ok(())
}

fn print_config(config: &NodeAdminConfig) {
    println!("Configuration OK");
    println!("  host:          {}", config.host.hostname);
    println!("  capacity:      {}", config.host.capacity());
    println!("  repository:    {}", config.repository.url);
    println!("  docker:        {}", config.runtime.docker_binary);
    println!(
        "  hooks:         {} (as {})",
        config.runtime.node_program, config.runtime.exec_user
    );
    println!(
        "  storage:       {} (retention {}d)",
        config.storage.root.display(),
        config.storage.retention_days
    );
    println!(
        "  ticks:         every {}s (+{}s jitter), discovery every {}s",
        config.scheduler.tick_interval_secs,
        config.scheduler.tick_jitter_secs,
        config.scheduler.discovery_interval_secs
    );
    println!(
        "  backoff:       {}s..{}s, resync after {} skipped ticks",
        config.scheduler.backoff_base_secs,
        config.scheduler.backoff_max_secs,
        config.scheduler.resync_every_ticks
    );
}

fn cmd_archive_cleanup(config_path: Option<PathBuf>) -> Result<()> {
    let config = wiring::load_config(config_path.as_deref())?;
    let storage = wiring::storage_maintainer(&config);
    let removed = wiring::block_on(async move {
        storage
            .cleanup_after_archive()
            .await
            .with_context(|| "Archive cleanup failed")
    })?;
    println!(
        "Removed {} expired archive(s) under {}",
        removed,
        config.storage.root.join("archive").display()
    );
    Ok(())
}
