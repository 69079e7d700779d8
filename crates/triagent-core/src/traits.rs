use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{AgentInput, AgentOutput, AgentType, ToolResult};

/// Agent executor: one analysis stage behind a uniform request/response seam.
///
/// Implementations that cannot serve a request (model offline, capacity gone)
/// return `TriagentError::AgentUnavailable`; that error is never retried.
pub trait AgentExecutor: Send + Sync + 'static {
    /// The stage this executor implements.
    fn agent_type(&self) -> AgentType;

    /// Model identifier reported in logs.
    fn model(&self) -> &str {
        "unspecified"
    }

    /// Run the stage for one node of one execution.
    fn execute(&self, input: AgentInput) -> BoxFuture<'_, Result<AgentOutput>>;
}

/// Action tool: an external side effect (task manager, calendar, notification).
pub trait ActionTool: Send + Sync + 'static {
    /// Tool name (used in logs and the registry listing).
    fn name(&self) -> &str;

    /// Action types this tool handles, e.g. `create_task`.
    fn action_types(&self) -> Vec<String>;

    /// Perform the action. `idempotency_key` is stable across re-routing.
    fn execute(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        idempotency_key: String,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for one call.
    fn timeout_secs(&self) -> u64 {
        30
    }
}
