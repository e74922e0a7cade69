use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use nodeadm_agent::{Capabilities, HostOrchestrator, HostResources};
use nodeadm_core::config::{self, NodeAdminConfig};
use nodeadm_core::retry::{BackoffPolicy, retry};
use nodeadm_noderepo::HttpNodeRepository;
use nodeadm_runtime::docker::DockerCli;
use nodeadm_runtime::storage::FsStorageMaintainer;

/// Load and validate the config named on the command line, or the default.
pub fn load_config(explicit: Option<&Path>) -> Result<NodeAdminConfig> {
    let path = config::config_path(explicit);
    NodeAdminConfig::from_file(&path)
        .with_context(|| format!("Invalid configuration at {}", path.display()))
}

pub fn storage_maintainer(config: &NodeAdminConfig) -> FsStorageMaintainer {
    FsStorageMaintainer::new(config.storage.root.clone(), config.storage.retention())
}

/// Production capabilities: Docker CLI, filesystem storage, HTTP repository.
pub fn capabilities(config: &NodeAdminConfig) -> Result<Capabilities> {
    let runtime = DockerCli::new(&config.runtime.docker_binary)
        .with_timeout(config.runtime.call_timeout())
        .with_storage_root(config.storage.root.clone());
    let repository =
        HttpNodeRepository::new(&config.repository.url, config.repository.call_timeout())?;

    Ok(Capabilities {
        runtime: Arc::new(runtime),
        storage: Arc::new(storage_maintainer(config)),
        repository: Arc::new(repository),
        resources: Arc::new(HostResources::new(config.host.capacity())),
    })
}

/// Reserve capacity for every other node on this host that wants a
/// container, so a one-shot converge sees the same ledger the daemon would.
/// Returns how many reservations were made.
pub async fn seed_reservations(caps: &Capabilities, host: &str, except: &str) -> Result<usize> {
    let nodes = retry(3, BackoffPolicy::default(), "list nodes", move || {
        caps.repository.list_nodes(host)
    })
    .await
    .with_context(|| format!("Failed to list nodes on {}", host))?;
    let mut seeded = 0;
    for spec in nodes {
        if spec.hostname == except || !spec.state.wants_container() {
            continue;
        }
        match caps.resources.reserve(&spec.hostname, spec.resources()) {
            Ok(()) => seeded += 1,
            Err(e) => warn!(hostname = %spec.hostname, error = %e, "Node does not fit host capacity"),
        }
    }
    Ok(seeded)
}

/// Host maintenance signals: SIGUSR1 suspends every agent, SIGUSR2 resumes.
///
/// Handlers are installed before this returns, so a signal sent right after
/// cannot kill the process. Must be called from inside a tokio runtime.
pub fn watch_maintenance_signals(orchestrator: Arc<HostOrchestrator>) -> Result<JoinHandle<()>> {
    let mut suspend = signal(SignalKind::user_defined1())
        .with_context(|| "Failed to install SIGUSR1 handler")?;
    let mut resume = signal(SignalKind::user_defined2())
        .with_context(|| "Failed to install SIGUSR2 handler")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = suspend.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(signal = "SIGUSR1", "Suspend requested");
                    orchestrator.suspend();
                }
                received = resume.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(signal = "SIGUSR2", "Resume requested");
                    orchestrator.resume();
                }
            }
        }
    }))
}

/// Run an async command to completion on a fresh multi-thread runtime.
pub fn block_on<F, T>(f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}
