//! Error types for graph compilation and execution
//!
//! Every failure the core can produce carries an [`ErrorCode`] - the stable
//! string surfaced in status events, node logs, and execution records. The
//! richer [`CoreError`] enum is what flows through `Result` internally.

use thiserror::Error;

/// Stable error codes surfaced to callers and persisted on records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A required input port of a reachable node is not connected
    BuildBrokenInput,
    /// A required capability (e.g. a model on an AI node) is not bound
    BuildMissingCapability,
    /// The data-edge graph contains a cycle outside a loop construct
    BuildCyclicGraph,
    /// An edge violates port typing or handle rules
    BuildIncompatibleEdge,
    /// Two route emitters share a topological wave
    BuildRouteConflict,
    /// A node runnable raised; the subtype code is chosen by the runnable
    RuntimeNodeFailure,
    /// Sub-workflow nesting exceeded the configured ceiling
    RecursionLimit,
    /// A template failed to resolve under strict mode
    TemplateResolutionFailure,
    /// The owning epic's budget was exceeded
    BudgetExceeded,
    /// User-initiated cancellation
    Cancelled,
    /// A node runnable exceeded its per-type timeout
    Timeout,
    /// The execution exceeded the zombie threshold and was reaped
    Zombie,
    /// A checkpoint blob could not be rehydrated
    CheckpointCorrupt,
    /// A scheduled job exhausted its retries
    SchedulerRetryExhausted,
}

impl ErrorCode {
    /// The wire representation stored on records and sent in events
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BuildBrokenInput => "BUILD_BROKEN_INPUT",
            ErrorCode::BuildMissingCapability => "BUILD_MISSING_CAPABILITY",
            ErrorCode::BuildCyclicGraph => "BUILD_CYCLIC_GRAPH",
            ErrorCode::BuildIncompatibleEdge => "BUILD_INCOMPATIBLE_EDGE",
            ErrorCode::BuildRouteConflict => "BUILD_ROUTE_CONFLICT",
            ErrorCode::RuntimeNodeFailure => "RUNTIME_NODE_FAILURE",
            ErrorCode::RecursionLimit => "RECURSION_LIMIT",
            ErrorCode::TemplateResolutionFailure => "TEMPLATE_RESOLUTION_FAILURE",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Zombie => "ZOMBIE",
            ErrorCode::CheckpointCorrupt => "CHECKPOINT_CORRUPT",
            ErrorCode::SchedulerRetryExhausted => "SCHEDULER_RETRY_EXHAUSTED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised during graph compilation and execution
#[derive(Debug, Error)]
pub enum CoreError {
    /// Graph compilation failed before any node ran
    #[error("graph build failed ({}): {message}", code.as_str())]
    Build { code: ErrorCode, message: String },

    /// An edge was rejected at graph mutation time
    #[error("edge rejected: {0}")]
    InvalidEdge(String),

    /// A node runnable raised during execution
    #[error("node '{node_id}' failed ({code}): {message}")]
    NodeFailed {
        node_id: String,
        /// Subtype code chosen by the runnable (or an [`ErrorCode`] string)
        code: String,
        message: String,
    },

    /// The execution was cancelled by the user
    #[error("execution cancelled")]
    Cancelled,

    /// A node ran past its per-type timeout
    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    /// The owning epic's budget was exceeded
    #[error("budget exceeded for epic {epic_id}")]
    BudgetExceeded { epic_id: String },

    /// A template failed to resolve under strict mode
    #[error("template resolution failed: {0}")]
    Template(String),

    /// Component registry misuse (unknown type, duplicate registration)
    #[error("component registry error: {0}")]
    Registry(String),

    /// Checkpoint persistence failed
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] pipelit_checkpoint::CheckpointError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General execution failure
    #[error("execution error: {0}")]
    Execution(String),
}

impl CoreError {
    /// Build-time error constructor
    pub fn build(code: ErrorCode, message: impl Into<String>) -> Self {
        CoreError::Build {
            code,
            message: message.into(),
        }
    }

    /// Node failure with an explicit subtype code
    pub fn node_failed(
        node_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CoreError::NodeFailed {
            node_id: node_id.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// The stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Build { code, .. } => *code,
            CoreError::InvalidEdge(_) => ErrorCode::BuildIncompatibleEdge,
            CoreError::NodeFailed { .. } => ErrorCode::RuntimeNodeFailure,
            CoreError::Cancelled => ErrorCode::Cancelled,
            CoreError::NodeTimeout { .. } => ErrorCode::Timeout,
            CoreError::BudgetExceeded { .. } => ErrorCode::BudgetExceeded,
            CoreError::Template(_) => ErrorCode::TemplateResolutionFailure,
            CoreError::Checkpoint(pipelit_checkpoint::CheckpointError::Corrupt { .. }) => {
                ErrorCode::CheckpointCorrupt
            }
            _ => ErrorCode::RuntimeNodeFailure,
        }
    }

    /// The code string to persist, preferring the runnable's subtype code
    pub fn code_str(&self) -> String {
        match self {
            CoreError::NodeFailed { code, .. } => code.clone(),
            other => other.code().as_str().to_string(),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::BuildBrokenInput.as_str(), "BUILD_BROKEN_INPUT");
        assert_eq!(ErrorCode::BudgetExceeded.as_str(), "BUDGET_EXCEEDED");
        assert_eq!(ErrorCode::Zombie.as_str(), "ZOMBIE");
    }

    #[test]
    fn test_node_failed_keeps_subtype_code() {
        let err = CoreError::node_failed("n1", "HTTP_500", "upstream exploded");
        assert_eq!(err.code(), ErrorCode::RuntimeNodeFailure);
        assert_eq!(err.code_str(), "HTTP_500");
    }

    #[test]
    fn test_build_error_display() {
        let err = CoreError::build(ErrorCode::BuildCyclicGraph, "cycle via a -> b -> a");
        let text = err.to_string();
        assert!(text.contains("BUILD_CYCLIC_GRAPH"));
        assert!(text.contains("cycle via"));
    }
}
