use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use triagent_core::error::{Result, TriagentError};
use triagent_core::traits::ActionTool;
use triagent_core::types::ToolResult;

/// One recorded action-tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub action_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
enum Behavior {
    Succeed,
    Reject(String),
    Error(String),
}

/// Action tool that records every call and answers with a fixed behavior.
pub struct RecordingTool {
    action_types: Vec<String>,
    behavior: Behavior,
    calls: Arc<Mutex<Vec<ToolCall>>>,
}

impl RecordingTool {
    fn new(action_types: &[&str], behavior: Behavior) -> Self {
        Self {
            action_types: action_types.iter().map(|s| s.to_string()).collect(),
            behavior,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns `success` with external id `ext-<idempotency_key>`.
    pub fn succeeding(action_types: &[&str]) -> Self {
        Self::new(action_types, Behavior::Succeed)
    }

    /// Returns `success = false` with the given error.
    pub fn rejecting(action_types: &[&str], error: &str) -> Self {
        Self::new(action_types, Behavior::Reject(error.to_string()))
    }

    /// Returns a transport-level error.
    pub fn erroring(action_types: &[&str], error: &str) -> Self {
        Self::new(action_types, Behavior::Error(error.to_string()))
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<ToolCall>>> {
        self.calls.clone()
    }
}

impl ActionTool for RecordingTool {
    fn name(&self) -> &str {
        "recording"
    }

    fn action_types(&self) -> Vec<String> {
        self.action_types.clone()
    }

    fn execute(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        idempotency_key: String,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        let action_type = action_type.to_string();
        Box::pin(async move {
            self.calls.lock().expect("calls lock").push(ToolCall {
                action_type: action_type.clone(),
                payload,
                idempotency_key: idempotency_key.clone(),
            });
            match &self.behavior {
                Behavior::Succeed => Ok(ToolResult::ok(format!("ext-{}", idempotency_key))),
                Behavior::Reject(e) => Ok(ToolResult::error(e.clone())),
                Behavior::Error(e) => Err(TriagentError::ActionExecution {
                    action_type,
                    message: e.clone(),
                }),
            }
        })
    }
}
