use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::node::ResourceAllocation;
use crate::retry::BackoffPolicy;

/// Default config file location, overridable via `NODEADM_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodeadm/nodeadm.toml";

/// Node program invoked inside containers for lifecycle hooks.
pub const DEFAULT_NODE_PROGRAM: &str = "/opt/vespa/bin/vespa-nodectl";

/// Resolve the config path: explicit argument > `NODEADM_CONFIG` > default.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var("NODEADM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Top-level node admin configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeAdminConfig {
    pub host: HostConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Identity and physical capacity of this host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Hostname the node repository knows this host by (parent of the nodes).
    pub hostname: String,
    pub vcpus: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
}

/// Node repository endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_repository_url")]
    pub url: String,
    /// Per-call timeout (seconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

/// Container runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    /// Per-call timeout (seconds).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// User that lifecycle hooks run as inside the container.
    #[serde(default = "default_exec_user")]
    pub exec_user: String,
    /// Program inside the container that implements `resume` / `restart`.
    #[serde(default = "default_node_program")]
    pub node_program: String,
}

/// Host-local storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root holding `live/<container>` and `archive/<container>_<stamp>`.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Archives older than this are reclaimed by cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

/// Tick, discovery and backoff policy.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Random extra delay added to every tick, to spread load.
    #[serde(default = "default_tick_jitter")]
    pub tick_jitter_secs: u64,
    /// How often the set of nodes on this host is re-fetched.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Force a full inspect after this many consecutive skipped ticks.
    #[serde(default = "default_resync_every_ticks")]
    pub resync_every_ticks: u32,
}

fn default_repository_url() -> String {
    "http://localhost:4080".to_string()
}
fn default_call_timeout() -> u64 {
    30
}
fn default_docker_binary() -> String {
    "docker".to_string()
}
fn default_exec_user() -> String {
    "root".to_string()
}
fn default_node_program() -> String {
    DEFAULT_NODE_PROGRAM.to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("/home/docker/container-storage")
}
fn default_retention_days() -> u64 {
    7
}
fn default_tick_interval() -> u64 {
    30
}
fn default_tick_jitter() -> u64 {
    5
}
fn default_discovery_interval() -> u64 {
    60
}
fn default_backoff_base() -> u64 {
    1
}
fn default_backoff_max() -> u64 {
    300
}
fn default_resync_every_ticks() -> u32 {
    10
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: default_repository_url(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            call_timeout_secs: default_call_timeout(),
            exec_user: default_exec_user(),
            node_program: default_node_program(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            tick_jitter_secs: default_tick_jitter(),
            discovery_interval_secs: default_discovery_interval(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            resync_every_ticks: default_resync_every_ticks(),
        }
    }
}

impl NodeAdminConfig {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read nodeadm config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse nodeadm config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.host.hostname.trim().is_empty() {
            anyhow::bail!("[host] hostname must not be empty");
        }
        if !self.host.capacity().is_positive() {
            anyhow::bail!(
                "[host] capacity must be positive in every dimension, got {}",
                self.host.capacity()
            );
        }
        if !self.repository.url.starts_with("http://") && !self.repository.url.starts_with("https://")
        {
            anyhow::bail!(
                "[repository] url must be http:// or https://, got {:?}",
                self.repository.url
            );
        }
        if self.repository.call_timeout_secs == 0 || self.runtime.call_timeout_secs == 0 {
            anyhow::bail!("call_timeout_secs must be at least 1");
        }
        if self.scheduler.tick_interval_secs == 0 {
            anyhow::bail!("[scheduler] tick_interval_secs must be at least 1");
        }
        if self.scheduler.backoff_max_secs < self.scheduler.backoff_base_secs {
            anyhow::bail!("[scheduler] backoff_max_secs must be >= backoff_base_secs");
        }
        if self.runtime.exec_user.is_empty() || self.runtime.node_program.is_empty() {
            anyhow::bail!("[runtime] exec_user and node_program must not be empty");
        }
        Ok(())
    }
}

impl HostConfig {
    pub fn capacity(&self) -> ResourceAllocation {
        ResourceAllocation::new(self.vcpus, self.memory_gb, self.disk_gb)
    }
}

impl RepositoryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl RuntimeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn tick_jitter(&self) -> Duration {
        Duration::from_secs(self.tick_jitter_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    /// Backoff applied after failed ticks. Shares the tick jitter.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs),
            self.tick_jitter(),
        )
    }
}
