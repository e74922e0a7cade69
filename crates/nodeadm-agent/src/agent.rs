use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nodeadm_core::config::{DEFAULT_NODE_PROGRAM, NodeAdminConfig};
use nodeadm_core::error::{ConvergenceError, ConvergenceResult};
use nodeadm_core::image::DockerImage;
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::{NodeAttributes, NodeContext, NodeSpec, NodeState, NodeType};
use nodeadm_noderepo::NodeRepository;
use nodeadm_runtime::container::{ContainerRuntime, ContainerStatus};
use nodeadm_runtime::storage::{ArchiveOutcome, StorageMaintainer};

use crate::resources::HostResources;

/// Fingerprint used when the repository has no spec for the node.
const ABSENT_FINGERPRINT: &str = "absent";

/// Per-agent knobs, taken from `[runtime]` and `[scheduler]`.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub call_timeout: Duration,
    pub exec_user: String,
    pub node_program: String,
    pub resync_every_ticks: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            exec_user: "root".to_string(),
            node_program: DEFAULT_NODE_PROGRAM.to_string(),
            resync_every_ticks: 10,
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &NodeAdminConfig) -> Self {
        Self {
            call_timeout: config.runtime.call_timeout(),
            exec_user: config.runtime.exec_user.clone(),
            node_program: config.runtime.node_program.clone(),
            resync_every_ticks: config.scheduler.resync_every_ticks,
        }
    }
}

/// Shared handles every agent on the host works through.
#[derive(Clone)]
pub struct Capabilities {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub storage: Arc<dyn StorageMaintainer>,
    pub repository: Arc<dyn NodeRepository>,
    pub resources: Arc<HostResources>,
}

/// One corrective step applied during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RemoveContainer,
    CreateContainer,
    StartContainer,
    ExecResume,
    ExecRestart,
    Reboot,
    ArchiveStorage,
    MarkReady,
    PublishAttributes,
    ReportFault,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::RemoveContainer => "remove-container",
            Action::CreateContainer => "create-container",
            Action::StartContainer => "start-container",
            Action::ExecResume => "exec-resume",
            Action::ExecRestart => "exec-restart",
            Action::Reboot => "reboot",
            Action::ArchiveStorage => "archive-storage",
            Action::MarkReady => "mark-ready",
            Action::PublishAttributes => "publish-attributes",
            Action::ReportFault => "report-fault",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Desired state unchanged since the last converged tick.
    Skipped,
    /// Actual state now matches desired state. `actions` is empty when
    /// nothing needed doing.
    Converged { actions: Vec<Action> },
    /// Host-wide suspend observed; the tick stopped at a safe point.
    Suspended,
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::Skipped => f.write_str("skipped"),
            TickOutcome::Suspended => f.write_str("suspended"),
            TickOutcome::Converged { actions } if actions.is_empty() => f.write_str("converged"),
            TickOutcome::Converged { actions } => {
                let names: Vec<String> = actions.iter().map(Action::to_string).collect();
                write!(f, "converged [{}]", names.join(", "))
            }
        }
    }
}

/// Whether the `resume` hook still has to run in the current container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingResume {
    /// Resumed since it was last started, or no container.
    No,
    /// Started by this agent and not yet resumed.
    AfterStart,
    /// Found running by a fresh agent; nothing says it was ever resumed.
    Unverified,
}

/// Whether a mutation group ran to completion or stopped for a suspend.
enum Progress {
    Done,
    Suspended,
}

/// Drives one node's container towards the node repository's desired state.
///
/// Every call to [`tick`](Self::tick) re-reads desired and actual state and
/// applies the minimal corrective actions. A failed tick leaves nothing for
/// the next tick to resume; it starts over from fresh state.
pub struct NodeAgent {
    context: NodeContext,
    caps: Capabilities,
    settings: AgentSettings,
    suspend: watch::Receiver<bool>,
    retiring: bool,
    last_converged: Option<String>,
    skipped_ticks: u32,
    reported_fault: Option<String>,
    container_present: Option<bool>,
    pending_resume: PendingResume,
}

impl NodeAgent {
    pub fn new(
        hostname: &str,
        caps: Capabilities,
        settings: AgentSettings,
        suspend: watch::Receiver<bool>,
    ) -> Result<Self> {
        Ok(Self {
            context: NodeContext::new(hostname, NodeType::default())?,
            caps,
            settings,
            suspend,
            retiring: false,
            last_converged: None,
            skipped_ticks: 0,
            reported_fault: None,
            container_present: None,
            pending_resume: PendingResume::Unverified,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.context.hostname
    }

    pub fn container_name(&self) -> &ContainerName {
        &self.context.container_name
    }

    /// Container presence as of the last tick that inspected it.
    pub fn container_present(&self) -> Option<bool> {
        self.container_present
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    /// A retiring agent ignores the repository and only ensures its
    /// container is gone.
    pub fn set_retiring(&mut self, retiring: bool) {
        if self.retiring != retiring {
            self.retiring = retiring;
            self.last_converged = None;
        }
    }

    /// Forget the last converged fingerprint so the next tick inspects the
    /// container even if desired state is unchanged.
    pub fn invalidate(&mut self) {
        self.last_converged = None;
        self.skipped_ticks = 0;
    }

    fn suspended(&self) -> bool {
        *self.suspend.borrow()
    }

    /// Bound a capability call by the call timeout and map its error into
    /// the convergence taxonomy.
    async fn bounded<T, E, F>(&self, what: &str, call: F) -> ConvergenceResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ConvergenceError>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ConvergenceError::transient(format!(
                "{} for {} timed out after {}s",
                what,
                self.context.hostname,
                self.settings.call_timeout.as_secs()
            ))),
        }
    }

    /// Bytes held in the node's live storage directory.
    pub async fn storage_usage(&self) -> ConvergenceResult<u64> {
        self.bounded("disk usage", self.caps.storage.disk_usage(&self.context))
            .await
    }

    /// Run one convergence pass.
    pub async fn tick(&mut self) -> ConvergenceResult<TickOutcome> {
        if self.suspended() {
            return Ok(TickOutcome::Suspended);
        }

        let spec = if self.retiring {
            None
        } else {
            let hostname = self.context.hostname.clone();
            self.bounded("get_node_spec", self.caps.repository.get_node_spec(&hostname))
                .await?
        };

        let fingerprint = spec
            .as_ref()
            .map(NodeSpec::fingerprint)
            .unwrap_or_else(|| ABSENT_FINGERPRINT.to_string());
        if self.last_converged.as_deref() == Some(fingerprint.as_str())
            && self.skipped_ticks < self.settings.resync_every_ticks
        {
            self.skipped_ticks += 1;
            debug!(hostname = %self.context.hostname, "Desired state unchanged, skipping tick");
            return Ok(TickOutcome::Skipped);
        }
        self.skipped_ticks = 0;

        let mut actions = Vec::new();
        let result = match &spec {
            Some(spec) if spec.state == NodeState::Active => {
                self.converge_active(spec, &mut actions).await
            }
            Some(spec) if spec.state == NodeState::Dirty => {
                self.converge_dirty(spec, &mut actions).await
            }
            _ => self.ensure_absent(&mut actions).await,
        };

        match result {
            Ok(Progress::Done) => {
                self.last_converged = Some(fingerprint);
                if !actions.is_empty() {
                    info!(
                        hostname = %self.context.hostname,
                        state = %spec.as_ref().map(|s| s.state.as_str()).unwrap_or("absent"),
                        actions = ?actions,
                        "Node converged"
                    );
                }
                Ok(TickOutcome::Converged { actions })
            }
            Ok(Progress::Suspended) => {
                self.last_converged = None;
                info!(
                    hostname = %self.context.hostname,
                    actions = ?actions,
                    "Tick stopped for host suspend"
                );
                Ok(TickOutcome::Suspended)
            }
            Err(e) => {
                self.last_converged = None;
                if let ConvergenceError::NonRetryable(_) = &e {
                    if self.report_fault(&e).await {
                        actions.push(Action::ReportFault);
                    }
                }
                warn!(
                    hostname = %self.context.hostname,
                    kind = e.kind(),
                    error = %e,
                    actions = ?actions,
                    "Tick failed"
                );
                Err(e)
            }
        }
    }

    /// Publish a non-retryable error as a fault attribute, once per
    /// distinct message. Returns whether a report was sent.
    async fn report_fault(&mut self, err: &ConvergenceError) -> bool {
        let message = err.to_string();
        if self.reported_fault.as_deref() == Some(message.as_str()) {
            return false;
        }
        warn!(hostname = %self.context.hostname, error = %message, "Reporting node fault");
        let attributes = NodeAttributes::new().with_fault(&message);
        let hostname = self.context.hostname.clone();
        let result = self
            .bounded(
                "update_attributes",
                self.caps.repository.update_attributes(&hostname, &attributes),
            )
            .await;
        match result {
            Ok(()) => {
                self.reported_fault = Some(message);
                true
            }
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "Failed to report node fault");
                false
            }
        }
    }

    async fn inspect(&mut self) -> ConvergenceResult<Option<ContainerStatus>> {
        let name = self.context.container_name.clone();
        let status = self
            .bounded("inspect", self.caps.runtime.inspect(&name))
            .await?;
        self.container_present = Some(status.is_some());
        Ok(status)
    }

    /// A container labelled with a different hostname is not ours to touch.
    fn check_ownership(&self, status: &ContainerStatus) -> ConvergenceResult<()> {
        match &status.hostname {
            Some(owner) if *owner != self.context.hostname => Err(ConvergenceError::conflict(
                format!(
                    "container {} belongs to {}, not {}",
                    status.name, owner, self.context.hostname
                ),
            )),
            _ => Ok(()),
        }
    }

    async fn remove_container(
        &mut self,
        status: &ContainerStatus,
        actions: &mut Vec<Action>,
    ) -> ConvergenceResult<()> {
        let name = status.name.clone();
        if status.running {
            self.bounded("stop", self.caps.runtime.stop(&name)).await?;
        }
        self.bounded("remove", self.caps.runtime.remove(&name))
            .await?;
        self.container_present = Some(false);
        self.pending_resume = PendingResume::No;
        actions.push(Action::RemoveContainer);
        Ok(())
    }

    async fn start_container(&mut self, actions: &mut Vec<Action>) -> ConvergenceResult<()> {
        let name = self.context.container_name.clone();
        self.bounded("start", self.caps.runtime.start(&name))
            .await?;
        self.pending_resume = PendingResume::AfterStart;
        actions.push(Action::StartContainer);
        Ok(())
    }

    /// Run the `resume` hook. Stays pending across ticks until it succeeds.
    async fn resume(&mut self, actions: &mut Vec<Action>) -> ConvergenceResult<()> {
        self.exec_hook("resume").await?;
        self.pending_resume = PendingResume::No;
        actions.push(Action::ExecResume);
        Ok(())
    }

    async fn exec_hook(&self, hook: &str) -> ConvergenceResult<()> {
        let name = self.context.container_name.clone();
        let command = vec![self.settings.node_program.clone(), hook.to_string()];
        self.bounded(
            hook,
            self.caps
                .runtime
                .exec_as_user(&name, &self.settings.exec_user, &command),
        )
        .await
        .map(|_| ())
    }

    async fn converge_active(
        &mut self,
        spec: &NodeSpec,
        actions: &mut Vec<Action>,
    ) -> ConvergenceResult<Progress> {
        spec.validate()
            .map_err(|e| ConvergenceError::non_retryable(e.to_string()))?;
        let image: DockerImage = spec.wanted_docker_image.clone().ok_or_else(|| {
            ConvergenceError::non_retryable(format!("{} has no wanted image", spec.hostname))
        })?;
        self.context.node_type = spec.node_type;
        let name = self.context.container_name.clone();

        self.caps.resources.claim_name(&name, &spec.hostname)?;
        let _guard = self.caps.resources.lock_container(&name).await;

        let mut existing = self.inspect().await?;
        if let Some(status) = &existing {
            self.check_ownership(status)?;
        }
        // Until a resized container is replaced it still holds its old
        // limits, so the ledger carries the larger of the two shapes.
        let wanted = spec.resources();
        let held = existing
            .as_ref()
            .and_then(|status| status.resources)
            .map_or(wanted, |actual| actual.max_each(&wanted));
        self.caps.resources.reserve(&spec.hostname, held)?;
        if self.suspended() {
            return Ok(Progress::Suspended);
        }

        if let Some(status) = existing.clone() {
            let resized = status
                .resources
                .filter(|actual| !actual.matches(&wanted));
            if status.image != image || resized.is_some() {
                match resized {
                    Some(actual) if status.image == image => info!(
                        hostname = %spec.hostname,
                        from = %actual,
                        to = %wanted,
                        "Replacing container with new resources"
                    ),
                    _ => info!(
                        hostname = %spec.hostname,
                        from = %status.image,
                        to = %image,
                        "Replacing container with new image"
                    ),
                }
                self.remove_container(&status, actions).await?;
                existing = None;
                self.caps.resources.reserve(&spec.hostname, wanted)?;
                if self.suspended() {
                    return Ok(Progress::Suspended);
                }
            }
        }

        let fresh = match existing {
            None => {
                self.bounded(
                    "create_container",
                    self.caps.runtime.create_container(
                        &image,
                        &name,
                        &spec.hostname,
                        &wanted,
                    ),
                )
                .await?;
                self.container_present = Some(true);
                actions.push(Action::CreateContainer);
                self.start_container(actions).await?;
                self.resume(actions).await?;
                true
            }
            Some(status) if !status.running => {
                self.start_container(actions).await?;
                self.resume(actions).await?;
                true
            }
            Some(_) if self.pending_resume == PendingResume::AfterStart => {
                self.resume(actions).await?;
                true
            }
            Some(_) if self.pending_resume == PendingResume::Unverified => {
                self.resume(actions).await?;
                false
            }
            Some(_) => false,
        };

        if !fresh && spec.wants_reboot() {
            info!(
                hostname = %spec.hostname,
                generation = spec.wanted_reboot_generation,
                "Rebooting container"
            );
            self.bounded("stop", self.caps.runtime.stop(&name)).await?;
            self.bounded("start", self.caps.runtime.start(&name))
                .await?;
            self.pending_resume = PendingResume::AfterStart;
            self.exec_hook("resume").await?;
            self.pending_resume = PendingResume::No;
            actions.push(Action::Reboot);
        } else if !fresh && spec.wants_restart() {
            info!(
                hostname = %spec.hostname,
                generation = spec.wanted_restart_generation,
                "Restarting node services"
            );
            self.exec_hook("restart").await?;
            actions.push(Action::ExecRestart);
        }

        if self.suspended() {
            return Ok(Progress::Suspended);
        }

        let attributes = attributes_to_publish(spec, &image);
        if !attributes.is_empty() {
            let hostname = spec.hostname.clone();
            self.bounded(
                "update_attributes",
                self.caps.repository.update_attributes(&hostname, &attributes),
            )
            .await?;
            actions.push(Action::PublishAttributes);
        }
        self.reported_fault = None;
        Ok(Progress::Done)
    }

    async fn converge_dirty(
        &mut self,
        spec: &NodeSpec,
        actions: &mut Vec<Action>,
    ) -> ConvergenceResult<Progress> {
        let name = self.context.container_name.clone();
        self.caps.resources.claim_name(&name, &spec.hostname)?;
        {
            let _guard = self.caps.resources.lock_container(&name).await;
            if let Some(status) = self.inspect().await? {
                self.check_ownership(&status)?;
                self.remove_container(&status, actions).await?;
            }
        }
        self.caps.resources.release(&spec.hostname);

        if self.suspended() {
            return Ok(Progress::Suspended);
        }

        let outcome = self
            .bounded(
                "archive_node_storage",
                self.caps.storage.archive_node_storage(&self.context),
            )
            .await?;
        if let ArchiveOutcome::Archived(path) = outcome {
            info!(hostname = %spec.hostname, archive = %path.display(), "Archived node storage");
            actions.push(Action::ArchiveStorage);
        }

        let hostname = spec.hostname.clone();
        self.bounded(
            "set_node_state",
            self.caps
                .repository
                .set_node_state(&hostname, NodeState::Ready),
        )
        .await?;
        actions.push(Action::MarkReady);
        Ok(Progress::Done)
    }

    /// No container wanted: stop and remove ours if present, free the
    /// ledger and the name.
    async fn ensure_absent(&mut self, actions: &mut Vec<Action>) -> ConvergenceResult<Progress> {
        let hostname = self.context.hostname.clone();
        let name = self.context.container_name.clone();

        let foreign = self
            .caps
            .resources
            .owner_of(&name)
            .is_some_and(|owner| owner != hostname);
        if foreign {
            debug!(hostname = %hostname, container = %name, "Container name held by another node");
            self.container_present = Some(false);
            self.caps.resources.release(&hostname);
            return Ok(Progress::Done);
        }

        {
            let _guard = self.caps.resources.lock_container(&name).await;
            if let Some(status) = self.inspect().await? {
                if self.check_ownership(&status).is_ok() {
                    self.remove_container(&status, actions).await?;
                } else {
                    self.container_present = Some(false);
                }
            }
        }
        self.caps.resources.release(&hostname);
        self.caps.resources.release_name(&name, &hostname);
        Ok(Progress::Done)
    }
}

/// Facts that differ from what the repository last recorded.
fn attributes_to_publish(spec: &NodeSpec, image: &DockerImage) -> NodeAttributes {
    let mut attributes = NodeAttributes::new();
    if spec.current_docker_image.as_ref() != Some(image) {
        attributes = attributes.with_docker_image(image.clone());
    }
    let version = image.tag_as_version();
    if spec.current_vespa_version.as_deref() != Some(version.as_str()) {
        attributes = attributes.with_vespa_version(&version);
    }
    if spec.current_restart_generation != spec.wanted_restart_generation {
        attributes = attributes.with_restart_generation(spec.wanted_restart_generation);
    }
    if spec.current_reboot_generation != spec.wanted_reboot_generation {
        attributes = attributes.with_reboot_generation(spec.wanted_reboot_generation);
    }
    attributes
}
