use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nodeadm_core::config::NodeAdminConfig;
use nodeadm_core::error::{ConvergenceError, ConvergenceResult};
use nodeadm_core::naming::ContainerName;
use nodeadm_core::retry::{BackoffPolicy, jittered};

use crate::agent::{AgentSettings, Capabilities, NodeAgent};

/// Scheduling knobs for the host orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// This host's hostname; nodes are discovered by parent.
    pub host_hostname: String,
    pub tick_interval: Duration,
    pub tick_jitter: Duration,
    pub discovery_interval: Duration,
    pub backoff: BackoffPolicy,
    pub agent: AgentSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &NodeAdminConfig) -> Self {
        Self {
            host_hostname: config.host.hostname.clone(),
            tick_interval: config.scheduler.tick_interval(),
            tick_jitter: config.scheduler.tick_jitter(),
            discovery_interval: config.scheduler.discovery_interval(),
            backoff: config.scheduler.backoff_policy(),
            agent: AgentSettings::from_config(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// Between ticks.
    Waiting,
    Ticking,
    /// Parked outside a tick because the host is suspended.
    Suspended,
    Stopped,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentPhase::Waiting => "waiting",
            AgentPhase::Ticking => "ticking",
            AgentPhase::Suspended => "suspended",
            AgentPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot of one agent, published by its loop after every phase change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub hostname: String,
    pub phase: AgentPhase,
    pub retiring: bool,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub container_present: Option<bool>,
    pub last_tick: Option<DateTime<Utc>>,
}

impl AgentStatus {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            phase: AgentPhase::Waiting,
            retiring: false,
            last_outcome: None,
            last_error: None,
            consecutive_failures: 0,
            container_present: None,
            last_tick: None,
        }
    }

    /// The last finished tick ran in retiring mode and saw no container.
    fn retired_cleanly(&self) -> bool {
        self.retiring
            && self.phase != AgentPhase::Ticking
            && self.last_error.is_none()
            && self.last_tick.is_some()
            && self.container_present == Some(false)
    }
}

/// What a discovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub spawned: Vec<String>,
    pub retiring: Vec<String>,
    pub dropped: Vec<String>,
    pub respawned: Vec<String>,
}

struct AgentHandle {
    task: JoinHandle<()>,
    retiring: Arc<AtomicBool>,
    status: watch::Receiver<AgentStatus>,
    shutdown: watch::Sender<bool>,
}

/// Owns one [`NodeAgent`] task per node assigned to this host.
pub struct HostOrchestrator {
    settings: OrchestratorSettings,
    caps: Capabilities,
    agents: Mutex<HashMap<String, AgentHandle>>,
    suspend: watch::Sender<bool>,
}

impl HostOrchestrator {
    pub fn new(settings: OrchestratorSettings, caps: Capabilities) -> Self {
        let (suspend, _) = watch::channel(false);
        Self {
            settings,
            caps,
            agents: Mutex::new(HashMap::new()),
            suspend,
        }
    }

    fn spawn_agent(&self, hostname: &str, retiring: bool) -> anyhow::Result<AgentHandle> {
        let agent = NodeAgent::new(
            hostname,
            self.caps.clone(),
            self.settings.agent.clone(),
            self.suspend.subscribe(),
        )?;
        let retiring = Arc::new(AtomicBool::new(retiring));
        let (status_tx, status_rx) = watch::channel(AgentStatus::new(hostname));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_agent_loop(
            agent,
            self.settings.clone(),
            Arc::clone(&retiring),
            status_tx,
            shutdown_rx,
            self.suspend.subscribe(),
        ));
        Ok(AgentHandle {
            task,
            retiring,
            status: status_rx,
            shutdown: shutdown_tx,
        })
    }

    /// Reconcile the set of agents with the nodes the repository assigns to
    /// this host.
    pub async fn discover(&self) -> ConvergenceResult<DiscoveryReport> {
        let host = &self.settings.host_hostname;
        let specs = match tokio::time::timeout(
            self.settings.agent.call_timeout,
            self.caps.repository.list_nodes(host),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConvergenceError::transient(format!(
                    "list_nodes for {} timed out",
                    host
                )));
            }
        };
        let wanted: HashSet<String> = specs.into_iter().map(|s| s.hostname).collect();

        let mut report = DiscoveryReport::default();
        let mut agents = self.agents.lock().await;

        // Agent loops only exit on shutdown, so a finished task panicked.
        let crashed: Vec<String> = agents
            .iter()
            .filter(|(_, handle)| handle.task.is_finished() && !*handle.shutdown.borrow())
            .map(|(hostname, _)| hostname.clone())
            .collect();
        for hostname in crashed {
            let Some(old) = agents.remove(&hostname) else {
                continue;
            };
            let retiring = old.retiring.load(Ordering::SeqCst);
            if let Err(e) = old.task.await {
                error!(hostname = %hostname, error = %e, "Node agent task crashed");
            }
            match self.spawn_agent(&hostname, retiring) {
                Ok(handle) => {
                    warn!(hostname = %hostname, "Respawned node agent");
                    agents.insert(hostname.clone(), handle);
                    report.respawned.push(hostname);
                }
                Err(e) => error!(hostname = %hostname, error = %e, "Failed to respawn node agent"),
            }
        }

        let mut new_hosts: Vec<&String> = wanted.iter().filter(|h| !agents.contains_key(*h)).collect();
        new_hosts.sort();
        for hostname in new_hosts {
            match self.spawn_agent(hostname, false) {
                Ok(handle) => {
                    info!(hostname = %hostname, "Started node agent");
                    agents.insert(hostname.clone(), handle);
                    report.spawned.push(hostname.clone());
                }
                Err(e) => error!(hostname = %hostname, error = %e, "Failed to start node agent"),
            }
        }

        let mut to_drop = Vec::new();
        for (hostname, handle) in agents.iter() {
            if wanted.contains(hostname) {
                if handle.retiring.swap(false, Ordering::SeqCst) {
                    info!(hostname = %hostname, "Node reassigned, no longer retiring");
                }
                continue;
            }
            if !handle.retiring.swap(true, Ordering::SeqCst) {
                info!(hostname = %hostname, "Node no longer assigned, retiring agent");
                report.retiring.push(hostname.clone());
            } else if handle.status.borrow().retired_cleanly() {
                to_drop.push(hostname.clone());
            }
        }

        to_drop.sort();
        for hostname in to_drop {
            if !self.confirm_absent(&hostname).await {
                continue;
            }
            if let Some(handle) = agents.remove(&hostname) {
                handle.shutdown.send_replace(true);
                if let Err(e) = handle.task.await {
                    warn!(hostname = %hostname, error = %e, "Retired agent task ended abnormally");
                }
                info!(hostname = %hostname, "Dropped retired node agent");
                report.dropped.push(hostname);
            }
        }

        report.retiring.sort();
        report.respawned.sort();
        Ok(report)
    }

    /// Ask the runtime directly whether the retiring agent's container is gone.
    async fn confirm_absent(&self, hostname: &str) -> bool {
        let Ok(name) = ContainerName::from_hostname(hostname) else {
            return true;
        };
        match tokio::time::timeout(self.settings.agent.call_timeout, self.caps.runtime.inspect(&name))
            .await
        {
            Ok(Ok(None)) => true,
            Ok(Ok(Some(status))) => {
                let foreign = status
                    .hostname
                    .as_deref()
                    .is_some_and(|owner| owner != hostname);
                if !foreign {
                    debug!(hostname = %hostname, "Retiring container still present");
                }
                foreign
            }
            Ok(Err(e)) => {
                debug!(hostname = %hostname, error = %e, "Could not confirm container absence");
                false
            }
            Err(_) => false,
        }
    }

    /// Discover at `discovery_interval` until `stop` flips to true, then
    /// shut every agent down.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(host = %self.settings.host_hostname, "Host orchestrator started");
        while !*stop.borrow() {
            match self.discover().await {
                Ok(report) if report != DiscoveryReport::default() => {
                    info!(
                        spawned = ?report.spawned,
                        retiring = ?report.retiring,
                        dropped = ?report.dropped,
                        respawned = ?report.respawned,
                        "Discovery pass"
                    );
                }
                Ok(_) => debug!("Discovery pass, no changes"),
                Err(e) => warn!(error = %e, "Node discovery failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.discovery_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
        info!("Host orchestrator stopped");
    }

    /// Freeze all ticking host-wide. In-flight ticks stop at their next
    /// safe point.
    pub fn suspend(&self) {
        if !self.suspend.send_replace(true) {
            info!("Suspending all node agents");
        }
    }

    pub fn resume(&self) {
        if self.suspend.send_replace(false) {
            info!("Resuming all node agents");
        }
    }

    /// True once suspended and every agent has parked outside a tick.
    pub async fn is_frozen(&self) -> bool {
        if !*self.suspend.borrow() {
            return false;
        }
        self.agents.lock().await.values().all(|handle| {
            matches!(
                handle.status.borrow().phase,
                AgentPhase::Suspended | AgentPhase::Stopped
            )
        })
    }

    pub async fn status(&self) -> Vec<AgentStatus> {
        let mut all: Vec<AgentStatus> = self
            .agents
            .lock()
            .await
            .values()
            .map(|handle| handle.status.borrow().clone())
            .collect();
        all.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        all
    }

    /// Stop every agent loop, letting in-flight ticks finish.
    pub async fn shutdown(&self) {
        let mut agents = self.agents.lock().await;
        for handle in agents.values() {
            handle.shutdown.send_replace(true);
        }
        for (hostname, handle) in agents.drain() {
            if let Err(e) = handle.task.await {
                warn!(hostname = %hostname, error = %e, "Node agent ended abnormally");
            }
        }
    }
}

/// Strictly sequential tick loop for one node.
async fn run_agent_loop(
    mut agent: NodeAgent,
    settings: OrchestratorSettings,
    retiring: Arc<AtomicBool>,
    status: watch::Sender<AgentStatus>,
    mut shutdown: watch::Receiver<bool>,
    mut suspend: watch::Receiver<bool>,
) {
    let hostname = agent.hostname().to_string();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if *suspend.borrow_and_update() {
            status.send_modify(|s| s.phase = AgentPhase::Suspended);
            let senders_alive = tokio::select! {
                changed = shutdown.changed() => changed.is_ok(),
                changed = suspend.changed() => changed.is_ok(),
            };
            if !senders_alive {
                break;
            }
            if !*suspend.borrow() {
                agent.invalidate();
            }
            continue;
        }

        let is_retiring = retiring.load(Ordering::SeqCst);
        agent.set_retiring(is_retiring);
        status.send_modify(|s| {
            s.phase = AgentPhase::Ticking;
            s.retiring = is_retiring;
        });

        let result = agent.tick().await;
        let delay = match &result {
            Ok(_) => {
                failures = 0;
                jittered(settings.tick_interval, settings.tick_jitter)
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = settings.backoff.next_delay(failures);
                if e.is_retryable() {
                    debug!(
                        hostname = %hostname,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backing off after failed tick"
                    );
                } else {
                    warn!(
                        hostname = %hostname,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Node needs operator attention, backing off"
                    );
                }
                delay
            }
        };

        let container_present = agent.container_present();
        status.send_modify(|s| {
            s.phase = AgentPhase::Waiting;
            s.consecutive_failures = failures;
            s.container_present = container_present;
            s.last_tick = Some(Utc::now());
            match &result {
                Ok(outcome) => {
                    s.last_outcome = Some(outcome.to_string());
                    s.last_error = None;
                }
                Err(e) => {
                    s.last_outcome = Some(format!("failed ({})", e.kind()));
                    s.last_error = Some(e.to_string());
                }
            }
        });

        let senders_alive = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = shutdown.changed() => changed.is_ok(),
            changed = suspend.changed() => changed.is_ok(),
        };
        if !senders_alive {
            break;
        }
    }

    status.send_modify(|s| s.phase = AgentPhase::Stopped);
    debug!(hostname = %hostname, "Node agent loop stopped");
}
