use thiserror::Error;

/// Failure taxonomy of a convergence tick.
///
/// Every component error (runtime, storage, repository) converts into one of
/// these so the agent can decide between retrying, re-planning, and
/// surfacing a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvergenceError {
    /// Runtime or repository temporarily unreachable, or a call timed out.
    /// Retried on a later tick; nothing is persisted.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Desired or actual state changed between read and act. The tick's plan
    /// is abandoned and re-derived from fresh state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Invalid image reference or resource request beyond host capacity.
    /// Reported as a fault on the node; no destructive action is taken.
    #[error("non-retryable failure: {0}")]
    NonRetryable(String),
    /// Archiving node storage failed. The node stays dirty.
    #[error("storage fault: {0}")]
    StorageFault(String),
}

pub type ConvergenceResult<T> = Result<T, ConvergenceError>;

impl ConvergenceError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageFault(msg.into())
    }

    /// Short label for logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::NonRetryable(_) => "non_retryable",
            Self::StorageFault(_) => "storage_fault",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NonRetryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = ConvergenceError::transient("node repository returned 503");
        assert_eq!(
            err.to_string(),
            "transient failure: node repository returned 503"
        );
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn test_only_non_retryable_is_final() {
        assert!(ConvergenceError::transient("x").is_retryable());
        assert!(ConvergenceError::conflict("x").is_retryable());
        assert!(ConvergenceError::storage("x").is_retryable());
        assert!(!ConvergenceError::non_retryable("x").is_retryable());
    }
}
