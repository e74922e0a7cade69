use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use nodeadm_core::error::ConvergenceError;
use nodeadm_core::image::DockerImage;
use nodeadm_core::naming::ContainerName;
use nodeadm_core::node::ResourceAllocation;

/// Label put on every managed container, holding the node hostname.
pub const HOSTNAME_LABEL: &str = "nodeadm.hostname";

/// Runtime view of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: ContainerName,
    pub image: DockerImage,
    pub running: bool,
    /// Hostname of the node the container was created for, if labelled.
    pub hostname: Option<String>,
    pub resources: Option<ResourceAllocation>,
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The engine could not be reached or the call timed out.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("invalid image {image}: {reason}")]
    ImageInvalid { image: String, reason: String },
    #[error("resources exceeded for {name}: {reason}")]
    ResourceExceeded { name: String, reason: String },
    /// Operation needs an existing container but there is none.
    #[error("no such container: {0}")]
    ContainerNotFound(String),
    /// Another container already holds the name.
    #[error("container name {0} already in use")]
    NameInUse(String),
    /// A command inside the container exited non-zero.
    #[error("command {command:?} in {name} exited with {exit_code}: {stderr}")]
    ExecFailed {
        name: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl From<RuntimeError> for ConvergenceError {
    fn from(err: RuntimeError) -> Self {
        match &err {
            RuntimeError::Unavailable(_) | RuntimeError::ExecFailed { .. } => {
                ConvergenceError::Transient(err.to_string())
            }
            RuntimeError::ImageInvalid { .. } | RuntimeError::ResourceExceeded { .. } => {
                ConvergenceError::NonRetryable(err.to_string())
            }
            RuntimeError::ContainerNotFound(_) | RuntimeError::NameInUse(_) => {
                ConvergenceError::Conflict(err.to_string())
            }
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Capability interface over the container engine. No policy, pure mechanism.
///
/// Every operation is idempotent with respect to its target state: creating
/// an existing container with the same image, removing a missing container,
/// and stopping a stopped container all succeed without doing anything. The
/// agent relies on this when retrying after a call with unknown outcome.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container for `hostname`.
    async fn create_container(
        &self,
        image: &DockerImage,
        name: &ContainerName,
        hostname: &str,
        resources: &ResourceAllocation,
    ) -> RuntimeResult<()>;

    async fn start(&self, name: &ContainerName) -> RuntimeResult<()>;

    async fn stop(&self, name: &ContainerName) -> RuntimeResult<()>;

    /// Remove the container, stopping it first if it is running.
    async fn remove(&self, name: &ContainerName) -> RuntimeResult<()>;

    /// Run `command` inside the container as `user`. A non-zero exit is
    /// returned as [`RuntimeError::ExecFailed`].
    async fn exec_as_user(
        &self,
        name: &ContainerName,
        user: &str,
        command: &[String],
    ) -> RuntimeResult<ExecOutput>;

    async fn inspect(&self, name: &ContainerName) -> RuntimeResult<Option<ContainerStatus>>;
}
