use async_trait::async_trait;
use thiserror::Error;

use nodeadm_core::error::ConvergenceError;
use nodeadm_core::node::{NodeAttributes, NodeSpec, NodeState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// Unreachable, timed out, or answered with a non-2xx status.
    #[error("node repository unavailable: {0}")]
    Transient(String),
    #[error("node {0} not found in node repository")]
    NotFound(String),
    #[error("malformed node repository payload: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ConvergenceError {
    fn from(err: RepositoryError) -> Self {
        match &err {
            RepositoryError::Transient(_) | RepositoryError::Decode(_) => {
                ConvergenceError::Transient(err.to_string())
            }
            RepositoryError::NotFound(_) => ConvergenceError::Conflict(err.to_string()),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Desired state source and sink for reported node attributes.
///
/// Implementations do not retry; callers bound every call with a timeout and
/// retry on their own schedule.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// `None` if the repository does not know the node.
    async fn get_node_spec(&self, hostname: &str) -> RepositoryResult<Option<NodeSpec>>;

    /// All nodes whose parent is `parent_hostname`.
    async fn list_nodes(&self, parent_hostname: &str) -> RepositoryResult<Vec<NodeSpec>>;

    /// Report observed facts. Only the fields set in `attributes` are sent.
    async fn update_attributes(
        &self,
        hostname: &str,
        attributes: &NodeAttributes,
    ) -> RepositoryResult<()>;

    async fn set_node_state(&self, hostname: &str, state: NodeState) -> RepositoryResult<()>;
}
