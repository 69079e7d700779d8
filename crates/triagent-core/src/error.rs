use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriagentError {
    // Graph construction
    #[error("Graph construction failed: {0}")]
    GraphConstruction(String),

    // Node errors (absorbed by the orchestrator for non-critical nodes)
    #[error("Node timeout after {timeout_ms}ms: {node_id}")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    #[error("Node {node_id} exhausted {attempts} attempts: {last_error}")]
    NodeRetryExhausted {
        node_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Critical node {node_id} failed in execution {execution_id}: {reason}")]
    CriticalNodeFailure {
        execution_id: String,
        node_id: String,
        reason: String,
    },

    #[error("Orchestration timeout after {sla_secs}s: {execution_id}")]
    OrchestrationTimeout { execution_id: String, sla_secs: u64 },

    // Agent errors
    #[error("Agent unavailable: {agent}: {reason}")]
    AgentUnavailable { agent: String, reason: String },

    #[error("Agent execution failed: {agent}: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("No executor registered for agent type: {0}")]
    AgentNotRegistered(String),

    // Action errors
    #[error("Action tool not found: {0}")]
    ToolNotFound(String),

    #[error("Action execution failed: {action_type}: {message}")]
    ActionExecution {
        action_type: String,
        message: String,
    },

    #[error("Execution {execution_id} is not routable in status {status}")]
    NotRoutable { execution_id: String, status: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TriagentError {
    /// Whether this error aborts the whole execution.
    pub fn is_critical(&self) -> bool {
        matches!(self, TriagentError::CriticalNodeFailure { .. })
    }

    /// Whether a node attempt that failed with this error may be retried.
    ///
    /// Unavailability is a definitive signal and is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriagentError::NodeTimeout { .. }
                | TriagentError::AgentExecution { .. }
                | TriagentError::Http(_)
                | TriagentError::Io(_)
                | TriagentError::Json(_)
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TriagentError::AgentUnavailable { .. } | TriagentError::AgentNotRegistered(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TriagentError>;
